//! One-shot convenience path on top of the streaming session.

use std::sync::Arc;

use crate::error::SessionError;
use crate::model::SpeechModel;
use crate::streaming::{StreamingConfig, StreamingSession, TranscriptionEvent};

/// Transcribe a whole buffer of 16 kHz mono samples and return the final
/// text. Runs the regular streaming session to completion; there is no
/// second decode path.
pub fn transcribe<M: SpeechModel>(
    model: Arc<M>,
    samples: &[f32],
    config: StreamingConfig,
) -> Result<String, SessionError> {
    let session = StreamingSession::new(model, config)?;
    let events = session.events();

    session.feed_audio(samples);
    session.stop()?;

    if let Some(events) = events {
        for event in events {
            if let TranscriptionEvent::Ended { full_text } = event {
                return Ok(full_text);
            }
        }
    }
    Ok(String::new())
}
