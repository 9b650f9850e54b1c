#![allow(dead_code)]
//! Deterministic scripted stand-in for the external encoder + LM.
//!
//! `encode` maps every mel frame to a feature row carrying the frame's
//! signature; the decode script is one token per feature row, derived from
//! that signature. Because signatures only depend on frame content, a
//! growing pending window always yields a prefix-stable token sequence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ndarray::{Array2, ArrayView2};
use streamscribe::features::FeaturizerConfig;
use streamscribe::model::{ForwardInput, ModelError, SpeechModel, EOS_TOKEN_IDS};
use streamscribe::StreamingConfig;

pub const VOCAB_SIZE: usize = 151_646;
pub const TOKEN_BASE: i32 = 1_000;

const BOS: i32 = 1;
const AUDIO_PAD: i32 = 0;
const START: i32 = 2;
const AUDIO_MARKER: f32 = 1.0;

pub fn token_for(signature: f32) -> i32 {
    TOKEN_BASE + ((signature.abs() * 16.0) as i64 % 64) as i32
}

pub struct MockModel {
    filterbank: Array2<f32>,
    forward_delay: Duration,
    tokenizer_bound: bool,
    /// Generation stops once this many script tokens have been consumed.
    eos_after: Option<usize>,
    pub encode_calls: AtomicUsize,
    forwards_in_flight: AtomicUsize,
    pub max_concurrent_forwards: AtomicUsize,
}

pub struct MockCache {
    script: Vec<i32>,
    fed: usize,
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockModel {
    pub fn new() -> Self {
        let config = small_featurizer_config();
        Self {
            filterbank: Array2::ones((config.num_mel_bins, config.n_fft / 2 + 1)),
            forward_delay: Duration::ZERO,
            tokenizer_bound: true,
            eos_after: None,
            encode_calls: AtomicUsize::new(0),
            forwards_in_flight: AtomicUsize::new(0),
            max_concurrent_forwards: AtomicUsize::new(0),
        }
    }

    pub fn with_forward_delay(delay: Duration) -> Self {
        Self {
            forward_delay: delay,
            ..Self::new()
        }
    }

    pub fn without_tokenizer() -> Self {
        Self {
            tokenizer_bound: false,
            ..Self::new()
        }
    }

    pub fn with_eos_after(limit: usize) -> Self {
        Self {
            eos_after: Some(limit),
            ..Self::new()
        }
    }
}

impl SpeechModel for MockModel {
    type Cache = MockCache;

    fn encode(&self, mel: ArrayView2<'_, f32>) -> Result<Array2<f32>, ModelError> {
        self.encode_calls.fetch_add(1, Ordering::SeqCst);
        let mut features = Array2::zeros((mel.nrows(), 2));
        for (i, row) in mel.outer_iter().enumerate() {
            features[[i, 0]] = row.sum();
            features[[i, 1]] = AUDIO_MARKER;
        }
        Ok(features)
    }

    fn build_prompt(&self, num_audio_tokens: usize, _language: &str) -> Vec<i32> {
        let mut prompt = Vec::with_capacity(num_audio_tokens + 2);
        prompt.push(BOS);
        prompt.extend(std::iter::repeat(AUDIO_PAD).take(num_audio_tokens));
        prompt.push(START);
        prompt
    }

    fn embed_tokens(&self, ids: &[i32]) -> Array2<f32> {
        let mut embeds = Array2::zeros((ids.len(), 2));
        for (i, &id) in ids.iter().enumerate() {
            embeds[[i, 0]] = id as f32;
        }
        embeds
    }

    fn merge_audio_features(
        &self,
        mut inputs_embeds: Array2<f32>,
        audio_features: ArrayView2<'_, f32>,
        input_ids: &[i32],
    ) -> Array2<f32> {
        let mut next_audio_row = 0;
        for (i, &id) in input_ids.iter().enumerate() {
            if id == AUDIO_PAD && next_audio_row < audio_features.nrows() {
                inputs_embeds
                    .row_mut(i)
                    .assign(&audio_features.row(next_audio_row));
                next_audio_row += 1;
            }
        }
        inputs_embeds
    }

    fn make_cache(&self) -> MockCache {
        MockCache {
            script: Vec::new(),
            fed: 0,
        }
    }

    fn forward(
        &self,
        input: ForwardInput<'_>,
        cache: &mut MockCache,
    ) -> Result<Array2<f32>, ModelError> {
        let in_flight = self.forwards_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_forwards
            .fetch_max(in_flight, Ordering::SeqCst);
        if !self.forward_delay.is_zero() {
            thread::sleep(self.forward_delay);
        }

        match input {
            ForwardInput::Embeddings(embeds) => {
                cache.script = embeds
                    .outer_iter()
                    .filter(|row| row[1] == AUDIO_MARKER)
                    .map(|row| token_for(row[0]))
                    .collect();
                cache.fed = 0;
            }
            ForwardInput::Tokens(ids) => {
                cache.fed += ids.len();
            }
        }

        let exhausted = self.eos_after.is_some_and(|limit| cache.fed >= limit);
        let target = if exhausted {
            EOS_TOKEN_IDS[0]
        } else {
            cache.script.get(cache.fed).copied().unwrap_or(EOS_TOKEN_IDS[0])
        };

        let mut logits = Array2::zeros((1, VOCAB_SIZE));
        logits[[0, target as usize]] = 1.0;

        self.forwards_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(logits)
    }

    fn detokenize(&self, ids: &[i32]) -> Result<String, ModelError> {
        if !self.tokenizer_bound {
            return Err(ModelError::TokenizerUnavailable);
        }
        Ok(ids
            .iter()
            .map(|&id| format!("w{}", id - TOKEN_BASE))
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn mel_filterbank(&self) -> Array2<f32> {
        self.filterbank.clone()
    }
}

/// Tiny analysis geometry so tests can count frames by hand:
/// frame k covers samples `[2k, 2k + 4)`.
pub fn small_featurizer_config() -> FeaturizerConfig {
    FeaturizerConfig {
        n_fft: 4,
        hop_length: 2,
        num_mel_bins: 2,
    }
}

pub fn test_config() -> StreamingConfig {
    StreamingConfig {
        featurizer: small_featurizer_config(),
        window_frames: 5,
        decode_interval_seconds: 0.0,
        ..StreamingConfig::default()
    }
}

/// Deterministic non-constant sample generator.
pub fn ramp_samples(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i as f32) * 0.37).sin() * 0.5).collect()
}

/// All mel frames the session will see for `samples`, including the padded
/// terminal flush frame, replicated test-side.
pub fn mel_frames_for(samples: &[f32]) -> Array2<f32> {
    let config = small_featurizer_config();
    let filterbank = Array2::ones((config.num_mel_bins, config.n_fft / 2 + 1));
    let mut featurizer =
        streamscribe::features::MelFeaturizer::new(config, filterbank).expect("featurizer");

    let mut rows: Vec<f32> = Vec::new();
    let mut count = 0;
    if let Some(frames) = featurizer.process(samples) {
        count += frames.nrows();
        rows.extend(frames.iter().copied());
    }
    if let Some(frames) = featurizer.flush() {
        count += frames.nrows();
        rows.extend(frames.iter().copied());
    }
    Array2::from_shape_vec((count, 2), rows).expect("frame matrix")
}

/// The token the mock emits for each mel frame, replicated test-side.
pub fn expected_tokens_for_frames(frames: &Array2<f32>) -> Vec<i32> {
    frames.outer_iter().map(|row| token_for(row.sum())).collect()
}

pub fn expected_text_for_tokens(tokens: &[i32]) -> String {
    tokens
        .iter()
        .map(|&id| format!("w{}", id - TOKEN_BASE))
        .collect::<Vec<_>>()
        .join(" ")
}
