use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Sample rate expected at the session boundary (mono f32 PCM).
pub const SAMPLE_RATE: usize = 16_000;

/// Mel bins produced by the featurizer and consumed by the audio encoder.
pub const NUM_MEL_BINS: usize = 128;

/// Token ids that terminate an autoregressive decode pass.
pub const EOS_TOKEN_IDS: [i32; 2] = [151_645, 151_643];

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Encoder failed: {0}")]
    Encoder(String),

    #[error("Forward pass failed: {0}")]
    Forward(String),

    #[error("Tokenizer is not bound")]
    TokenizerUnavailable,
}

/// One forward step is fed either raw token ids or pre-merged embeddings.
pub enum ForwardInput<'a> {
    Tokens(&'a [i32]),
    Embeddings(ArrayView2<'a, f32>),
}

/// Interface to the external acoustic encoder and autoregressive LM.
///
/// Implementations own the weights and the tokenizer; the session only ever
/// talks to them through this trait, via a shared immutable handle. Tensors
/// are plain owned `ndarray` arrays, so results cross thread boundaries
/// without any wrapper types.
pub trait SpeechModel: Send + Sync + 'static {
    /// Opaque KV cache for a single decode pass.
    type Cache: Send;

    /// Encode a block of mel frames `(T, M)` into audio features `(T_a, D)`.
    fn encode(&self, mel: ArrayView2<'_, f32>) -> Result<Array2<f32>, ModelError>;

    /// Prompt token sequence containing `num_audio_tokens` placeholder slots.
    fn build_prompt(&self, num_audio_tokens: usize, language: &str) -> Vec<i32>;

    /// Embed a token sequence into `(L, E)`.
    fn embed_tokens(&self, ids: &[i32]) -> Array2<f32>;

    /// Splice encoded audio features into the placeholder slots of the
    /// prompt embedding.
    fn merge_audio_features(
        &self,
        inputs_embeds: Array2<f32>,
        audio_features: ArrayView2<'_, f32>,
        input_ids: &[i32],
    ) -> Array2<f32>;

    fn make_cache(&self) -> Self::Cache;

    /// One forward pass over the fed positions; returns logits `(L, V)`.
    fn forward(
        &self,
        input: ForwardInput<'_>,
        cache: &mut Self::Cache,
    ) -> Result<Array2<f32>, ModelError>;

    /// Decode token ids to text. `Err(TokenizerUnavailable)` when no
    /// tokenizer is bound; decode passes become no-ops in that case.
    fn detokenize(&self, ids: &[i32]) -> Result<String, ModelError>;

    /// Mel filterbank `(num_mel_bins, n_fft / 2 + 1)` handed to the
    /// featurizer at session construction.
    fn mel_filterbank(&self) -> Array2<f32> {
        crate::filterbank::mel_filter_bank(crate::features::N_FFT, NUM_MEL_BINS, SAMPLE_RATE)
    }
}
