//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the NCP
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Opening or configuring the port failed
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No response before the request timeout
    #[error("Timed out waiting for a response")]
    Timeout,

    /// No transport is attached
    #[error("Coordinator is disconnected, cannot send request")]
    NotConnected,

    /// Connecting failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport went away
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Bad signature, checksum or framing
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The API was used with arguments it cannot accept
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Parameters do not fit the command schema
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A payload does not fit its command schema
    #[error("Cannot decode command: {0}")]
    CommandDecode(String),

    /// The listener was cancelled or removed before a match
    #[error("Listener was cancelled")]
    Cancelled,

    /// Malformed configuration
    #[error("Configuration error: {0}")]
    ConfigError(#[from] serde_json::Error),

    /// Stream or file I/O failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serialport::Error> for ProtocolError {
    fn from(err: serialport::Error) -> Self {
        ProtocolError::SerialError(err.to_string())
    }
}

impl ProtocolError {
    /// Build an `InvalidFrame` error from anything printable
    pub(crate) fn invalid_frame(message: impl Into<String>) -> Self {
        ProtocolError::InvalidFrame(message.into())
    }
}
