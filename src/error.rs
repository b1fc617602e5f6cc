use crate::types::StreamKind;

/// Errors surfaced by sensor operations.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("Unsupported request: {0}")]
    UnsupportedRequest(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("No sampling frequency configured for {stream} at {fps} fps")]
    UnknownFrequency { stream: StreamKind, fps: u32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Thread error: {0}")]
    Thread(String),

    #[cfg(feature = "hidapi")]
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),
}

impl SensorError {
    /// Wrap a backend error with the operation that produced it.
    pub fn backend(context: &str, err: impl std::fmt::Display) -> Self {
        SensorError::Backend(format!("{}: {}", context, err))
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        SensorError::InvalidStateTransition(msg.into())
    }
}
