use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown actuator id {0}")]
    UnknownActuator(u8),
    #[error("unknown button id {0}")]
    UnknownButton(u8),
    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),
    #[error("invalid date/time")]
    InvalidDateTime,
    #[error("settings store failure: {0}")]
    Storage(#[from] StoreError),
}

/// Failures reported by a configuration store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store backend failed: {0}")]
    Backend(String),
}
