//! Windowed streaming encoder.
//!
//! Buffers mel frames into fixed-length windows. Every completed window is
//! handed to the external encoder exactly once and cached under its index;
//! the trailing partial window can be re-encoded cheaply on demand and is
//! never cached.

use std::collections::VecDeque;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2};

use crate::model::{ModelError, SpeechModel};

pub struct WindowedEncoder<M: SpeechModel> {
    model: Arc<M>,
    window_frames: usize,
    num_mel_bins: usize,
    max_cached_windows: usize,
    /// Row-major pending frames, `pending_frames * num_mel_bins` values.
    pending: Vec<f32>,
    pending_frames: usize,
    /// Completed-window cache, least-recently-accessed at the front.
    cache: VecDeque<(usize, Array2<f32>)>,
    /// Windows encoded since the last drain, in index order.
    newly_encoded: Vec<(usize, Array2<f32>)>,
    encoded_windows: usize,
}

impl<M: SpeechModel> WindowedEncoder<M> {
    pub fn new(
        model: Arc<M>,
        window_frames: usize,
        num_mel_bins: usize,
        max_cached_windows: usize,
    ) -> Self {
        Self {
            model,
            window_frames,
            num_mel_bins,
            max_cached_windows,
            pending: Vec::new(),
            pending_frames: 0,
            cache: VecDeque::new(),
            newly_encoded: Vec::new(),
            encoded_windows: 0,
        }
    }

    /// Append frames to the pending buffer and encode every window that
    /// completes. Returns the number of windows completed by this call.
    pub fn feed(&mut self, frames: ArrayView2<'_, f32>) -> Result<usize, ModelError> {
        for row in frames.outer_iter() {
            self.pending.extend(row.iter().copied());
        }
        self.pending_frames += frames.nrows();

        let mut completed = 0;
        while self.pending_frames >= self.window_frames {
            let len = self.window_frames * self.num_mel_bins;
            let window =
                Array2::from_shape_vec((self.window_frames, self.num_mel_bins), self.pending[..len].to_vec())
                    .map_err(|e| ModelError::Encoder(e.to_string()))?;

            let features = self.model.encode(window.view())?;
            let index = self.encoded_windows;
            self.insert_cached(index, features.clone());
            self.newly_encoded.push((index, features));
            self.encoded_windows += 1;

            self.pending.drain(..len);
            self.pending_frames -= self.window_frames;
            completed += 1;
            log::debug!(
                "encoded window {index} ({} frames still pending)",
                self.pending_frames
            );
        }

        Ok(completed)
    }

    pub fn has_pending_frames(&self) -> bool {
        self.pending_frames > 0
    }

    pub fn pending_frame_count(&self) -> usize {
        self.pending_frames
    }

    pub fn encoded_window_count(&self) -> usize {
        self.encoded_windows
    }

    /// Encode a fresh copy of the partial trailing window. The result is
    /// never cached; callers may invoke this arbitrarily often.
    pub fn encode_pending(&self) -> Result<Option<Array2<f32>>, ModelError> {
        if self.pending_frames == 0 {
            return Ok(None);
        }
        let window =
            Array2::from_shape_vec((self.pending_frames, self.num_mel_bins), self.pending.clone())
                .map_err(|e| ModelError::Encoder(e.to_string()))?;
        Ok(Some(self.model.encode(window.view())?))
    }

    /// Features of windows encoded since the last drain, in index order.
    pub fn drain_newly_encoded_windows(&mut self) -> Vec<Array2<f32>> {
        std::mem::take(&mut self.newly_encoded)
            .into_iter()
            .map(|(_, features)| features)
            .collect()
    }

    /// Cached features for a completed window, refreshing its recency.
    pub fn cached_window(&mut self, index: usize) -> Option<Array2<f32>> {
        let pos = self.cache.iter().position(|(i, _)| *i == index)?;
        let entry = self.cache.remove(pos)?;
        let features = entry.1.clone();
        self.cache.push_back(entry);
        Some(features)
    }

    pub fn cached_window_count(&self) -> usize {
        self.cache.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.pending_frames = 0;
        self.cache.clear();
        self.newly_encoded.clear();
        self.encoded_windows = 0;
    }

    fn insert_cached(&mut self, index: usize, features: Array2<f32>) {
        if self.max_cached_windows == 0 {
            return;
        }
        while self.cache.len() >= self.max_cached_windows {
            if let Some((evicted, _)) = self.cache.pop_front() {
                log::debug!("evicted cached window {evicted}");
            }
        }
        self.cache.push_back((index, features));
    }
}
