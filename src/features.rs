//! Incremental mel-spectrogram featurizer.
//!
//! Consumes raw f32 samples in arbitrary batches and emits aligned log-mel
//! frames. A residual of up to `n_fft - hop_length` unconsumed samples is
//! carried between calls, so the k-th frame of a session is identical no
//! matter how the samples were batched.

use std::f32::consts::PI;
use std::sync::Arc;

use ndarray::{aview1, Array1, Array2};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use thiserror::Error;

/// FFT size (one analysis window of samples).
pub const N_FFT: usize = 400;

/// Stride between consecutive analysis windows, in samples.
pub const HOP_LENGTH: usize = 160;

// NeMo-style additive guard before the log (2^-24).
const LOG_ZERO_GUARD: f32 = 5.960_464_5e-8;

#[derive(Error, Debug)]
pub enum FeaturizerError {
    #[error("Filterbank shape ({rows}, {cols}) does not match ({mels}, {bins}) for n_fft {n_fft}")]
    FilterbankShape {
        rows: usize,
        cols: usize,
        mels: usize,
        bins: usize,
        n_fft: usize,
    },

    #[error("hop_length {0} must be positive and no larger than n_fft {1}")]
    InvalidHop(usize, usize),
}

#[derive(Debug, Clone)]
pub struct FeaturizerConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub num_mel_bins: usize,
}

impl Default for FeaturizerConfig {
    fn default() -> Self {
        Self {
            n_fft: N_FFT,
            hop_length: HOP_LENGTH,
            num_mel_bins: crate::model::NUM_MEL_BINS,
        }
    }
}

pub struct MelFeaturizer {
    config: FeaturizerConfig,
    window: Vec<f32>,
    filterbank: Array2<f32>,
    fft: Arc<dyn Fft<f32>>,
    residual: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    power: Vec<f32>,
}

impl MelFeaturizer {
    /// The filterbank comes from the model side and must be shaped
    /// `(num_mel_bins, n_fft / 2 + 1)`.
    pub fn new(config: FeaturizerConfig, filterbank: Array2<f32>) -> Result<Self, FeaturizerError> {
        if config.hop_length == 0 || config.hop_length > config.n_fft {
            return Err(FeaturizerError::InvalidHop(config.hop_length, config.n_fft));
        }

        let bins = config.n_fft / 2 + 1;
        if filterbank.shape() != [config.num_mel_bins, bins] {
            return Err(FeaturizerError::FilterbankShape {
                rows: filterbank.shape()[0],
                cols: filterbank.shape()[1],
                mels: config.num_mel_bins,
                bins,
                n_fft: config.n_fft,
            });
        }

        let window = hann_window(config.n_fft);
        let fft = FftPlanner::new().plan_fft_forward(config.n_fft);
        let scratch = vec![Complex::new(0.0, 0.0); config.n_fft];
        let power = vec![0.0; bins];

        Ok(Self {
            config,
            window,
            filterbank,
            fft,
            residual: Vec::new(),
            scratch,
            power,
        })
    }

    /// Append samples and extract every complete analysis window that fits.
    /// Returns `None` when no new frame was produced.
    pub fn process(&mut self, samples: &[f32]) -> Option<Array2<f32>> {
        self.residual.extend_from_slice(samples);

        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        if self.residual.len() < n_fft {
            return None;
        }

        let num_frames = (self.residual.len() - n_fft) / hop + 1;
        let mut frames = Array2::zeros((num_frames, self.config.num_mel_bins));
        for k in 0..num_frames {
            let mel = self.compute_frame(k * hop);
            frames.row_mut(k).assign(&mel);
        }
        self.residual.drain(..num_frames * hop);

        log::trace!(
            "featurizer produced {num_frames} frames ({} residual samples)",
            self.residual.len()
        );
        Some(frames)
    }

    /// Emit at most one terminal frame by right-zero-padding the residual.
    pub fn flush(&mut self) -> Option<Array2<f32>> {
        if self.residual.is_empty() {
            return None;
        }

        self.residual.resize(self.config.n_fft, 0.0);
        let mel = self.compute_frame(0);
        self.residual.clear();

        let mut frames = Array2::zeros((1, self.config.num_mel_bins));
        frames.row_mut(0).assign(&mel);
        Some(frames)
    }

    pub fn reset(&mut self) {
        self.residual.clear();
    }

    fn compute_frame(&mut self, offset: usize) -> Array1<f32> {
        let n_fft = self.config.n_fft;
        for i in 0..n_fft {
            self.scratch[i] = Complex::new(self.residual[offset + i] * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let bins = n_fft / 2 + 1;
        for (b, power) in self.power.iter_mut().enumerate().take(bins) {
            *power = self.scratch[b].norm_sqr();
        }

        let mel = self.filterbank.dot(&aview1(&self.power));
        mel.mapv(|x| (x.max(0.0) + LOG_ZERO_GUARD).ln())
    }
}

fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 - 0.5 * ((2.0 * PI * i as f32) / (len as f32 - 1.0)).cos())
        .collect()
}
