use thiserror::Error;

/// Error taxonomy for the delivery core.
///
/// Illegal state transitions are deliberately absent: duplicate or
/// out-of-order client replays are logged and dropped, never surfaced
/// to the caller. `RotationInProgress` is the one retryable error a
/// caller is expected to back off on.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("group key rotation already in progress for group {0}")]
    RotationInProgress(String),

    #[error("rotation key set incomplete for group {0}")]
    IncompleteKeySet(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("push provider failure: {0}")]
    Provider(String),

    #[error("push registration invalid: {0}")]
    RegistrationInvalid(String),

    #[error("missing configuration: {0}")]
    ConfigurationMissing(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
