use thiserror::Error;

/// Failures of the realtime transport service.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying channel rejected a connect or a send.
    #[error("transport failure: {0}")]
    Failure(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }
}
