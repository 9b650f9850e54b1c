use thiserror::Error;

use crate::features::FeaturizerError;
use crate::model::ModelError;

/// Unified session errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Featurizer: {0}")]
    Featurizer(#[from] FeaturizerError),

    #[error("Model: {0}")]
    Model(#[from] ModelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session was cancelled")]
    Cancelled,
}

impl serde::Serialize for SessionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
