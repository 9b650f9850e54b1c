//! One autoregressive decode pass over an encoded feature block.
//!
//! Stateless: the caller supplies the features, the confirmed prefix and a
//! cancellation token, and receives the newly emitted tokens. Cancellation
//! is observed between every forward-pass boundary; an aborted pass returns
//! `Ok(None)` and has mutated nothing.

use std::time::Instant;

use ndarray::Array2;

use crate::model::{ForwardInput, ModelError, SpeechModel, EOS_TOKEN_IDS};
use crate::streaming::{CancelToken, StreamingConfig};

/// Encoder output frames per second of audio.
pub const ENCODER_TOKENS_PER_SECOND: f64 = 13.0;

/// Expected text tokens per second of speech, used to size the budget.
pub const TOKENS_PER_SECOND_HEURISTIC: f64 = 10.0;

/// Smallest decode budget granted to any pass.
pub const MIN_TOKEN_BUDGET: usize = 24;

#[derive(Debug, Clone)]
pub struct DecodePass {
    /// Newly emitted tokens, excluding the replayed confirmed prefix.
    pub tokens: Vec<i32>,
    pub decode_seconds: f64,
    /// Seconds of audio covered by the decoded features.
    pub windowed_seconds: f64,
}

pub fn run_decode<M: SpeechModel>(
    model: &M,
    encoded: &Array2<f32>,
    confirmed_prefix: &[i32],
    config: &StreamingConfig,
    cancel: &CancelToken,
) -> Result<Option<DecodePass>, ModelError> {
    let num_audio_tokens = encoded.nrows();
    if num_audio_tokens == 0 {
        return Ok(Some(DecodePass {
            tokens: Vec::new(),
            decode_seconds: 0.0,
            windowed_seconds: 0.0,
        }));
    }
    let start = Instant::now();

    let prompt = model.build_prompt(num_audio_tokens, &config.language);
    let embeds = model.embed_tokens(&prompt);
    let merged = model.merge_audio_features(embeds, encoded.view(), &prompt);

    let mut cache = model.make_cache();
    if cancel.is_cancelled() {
        return Ok(None);
    }
    let mut logits = model.forward(ForwardInput::Embeddings(merged.view()), &mut cache)?;

    // Prefix replay: rebuild the cache over the already-confirmed tokens.
    for &token in confirmed_prefix {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        logits = model.forward(ForwardInput::Tokens(&[token]), &mut cache)?;
    }

    let windowed_seconds = num_audio_tokens as f64 / ENCODER_TOKENS_PER_SECOND;
    let estimated =
        MIN_TOKEN_BUDGET.max((windowed_seconds * TOKENS_PER_SECOND_HEURISTIC).ceil() as usize);
    let max_tokens = config
        .max_tokens_per_pass
        .min(estimated.max(confirmed_prefix.len() + MIN_TOKEN_BUDGET));

    let mut emitted = Vec::new();
    for _ in 0..max_tokens.saturating_sub(confirmed_prefix.len()) {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let Some(next) = argmax_token(&logits, config.temperature) else {
            break;
        };
        if EOS_TOKEN_IDS.contains(&next) {
            break;
        }
        emitted.push(next);
        logits = model.forward(ForwardInput::Tokens(&[next]), &mut cache)?;
    }

    log::debug!(
        "decode pass: {} new tokens from {} audio tokens (prefix {}) in {:?}",
        emitted.len(),
        num_audio_tokens,
        confirmed_prefix.len(),
        start.elapsed()
    );

    Ok(Some(DecodePass {
        tokens: emitted,
        decode_seconds: start.elapsed().as_secs_f64(),
        windowed_seconds,
    }))
}

/// Argmax over the last-position logits. Temperature only rescales the
/// scores, so it changes nothing until argmax is replaced with sampling.
fn argmax_token(logits: &Array2<f32>, temperature: f32) -> Option<i32> {
    let last = logits.row(logits.nrows().checked_sub(1)?);
    let mut best = None;
    let mut best_score = f32::NEG_INFINITY;
    for (i, &logit) in last.iter().enumerate() {
        let score = if temperature > 0.0 {
            logit / temperature
        } else {
            logit
        };
        if score > best_score {
            best_score = score;
            best = Some(i as i32);
        }
    }
    best
}
