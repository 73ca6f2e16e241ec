//! WolfConnect Error Types

use thiserror::Error;

/// Result type alias for WolfConnect operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a datagram could not be decoded into a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bad magic cookie: {0:02x?}")]
    BadCookie([u8; 4]),

    #[error("truncated datagram: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("unsupported op code: {0}")]
    UnsupportedOp(u8),

    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(u8),

    #[error("invalid value for option {code}: {reason}")]
    InvalidOption { code: u32, reason: String },
}

/// WolfConnect error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    // Tunnel errors
    #[error("Device configuration failed on {interface}: {reason}")]
    Device { interface: String, reason: String },

    #[error("No tunnel network candidate left after {0}")]
    Exhausted(String),

    #[error("Tunnel store error: {0}")]
    Store(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error came from decoding a datagram
    pub fn is_decode(&self) -> bool {
        matches!(self, Error::Decode(_))
    }

    /// Check if this error must terminate the negotiation that hit it
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::Device { .. } | Error::Exhausted(_) | Error::ShuttingDown
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}
