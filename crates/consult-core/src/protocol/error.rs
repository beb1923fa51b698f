//! Protocol errors

use thiserror::Error;

/// Errors that can occur during Consult communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Not connected to ECU")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Unknown register id {0:#04x}")]
    UnknownRegister(u8),

    #[error("Unknown register name '{0}'")]
    UnknownRegisterName(String),

    #[error("Register {0:#04x} selected more than once")]
    DuplicateRegister(u8),

    #[error("Invalid register selection: {0}")]
    InvalidSelection(String),

    #[error("Framing overflow: {len} bytes buffered without a frame (max {max})")]
    FramingOverflow { len: usize, max: usize },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error is a transport-level failure that ends the session
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::SerialError(_)
                | ProtocolError::TransportError(_)
                | ProtocolError::IoError(_)
        )
    }
}
