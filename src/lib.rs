pub mod decode;
pub mod encoder;
pub mod features;
pub mod filterbank;
pub mod model;
pub mod streaming;
pub mod text;

mod error;
mod offline;

pub use error::SessionError;
pub use model::{ForwardInput, ModelError, SpeechModel};
pub use offline::transcribe;
pub use streaming::{
    CancelToken, DelayPreset, EventStream, MemoryProbe, NoopMemoryProbe, Stats, StreamingConfig,
    StreamingSession, TranscriptionEvent,
};
