//! Call-related error types.

use crate::error::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("already in a call")]
    AlreadyInCall,

    #[error("no local recipient bound for {0}")]
    UnknownRecipient(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid signal: {0}")]
    InvalidSignal(String),
}

impl CallError {
    /// Short human-readable text for a failure notification.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidTransition(_) => "That action isn't available right now.",
            Self::AlreadyInCall => "You're already in a call.",
            Self::UnknownRecipient(_) => "That user can't be reached.",
            Self::Transport(_) => "Connection problem. Please try again.",
            Self::InvalidSignal(_) => "Received an invalid call signal.",
        }
    }
}
