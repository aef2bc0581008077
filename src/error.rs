//! Call-related error types.

use callcore::media::DeviceErrorKind;
use callcore::signal::SignalError;
use callcore::state::InvalidTransition;
use thiserror::Error;

/// Capture device failure with its category preserved.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media device error: {0}")]
    Device(#[from] DeviceError),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("call not connected")]
    NotConnected,

    #[error("call already ended")]
    Ended,
}
