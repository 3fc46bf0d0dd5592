//! Error types for the tunnel engine
//!
//! Errors are categorized by subsystem. The policy split matters: frame
//! errors are fatal to the whole tunnel, relay errors are confined to one
//! logical flow, and configuration errors abort startup.

use std::io;

use thiserror::Error;

use crate::message::ResultCode;

/// Top-level error type for the tunnel engine
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration errors (file loading, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire framing and serialization errors
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Logical-connection errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Flow relay errors (remote endpoint failures)
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Transport I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Check whether this error must close the whole tunnel
    ///
    /// Frame and transport errors are fatal; per-flow and per-message
    /// errors are not.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Frame(_) | Self::Io(_) => true,
            Self::Connection(_) | Self::Relay(_) => false,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Wire framing errors
///
/// Any of these on the inbound path closes the tunnel; there is no way to
/// resynchronize a length-prefixed stream after a bad frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Length field outside the permitted `4..=131072` range
    #[error("Frame length {length} outside permitted range")]
    LengthOutOfRange { length: usize },

    /// Payload ended before the advertised length
    #[error("Truncated frame: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    /// Encoded message would exceed the maximum frame size
    #[error("Message encodes to {length} bytes, exceeding the frame limit")]
    Oversize { length: usize },

    /// Malformed payload encoding
    #[error("Failed to decode frame payload: {0}")]
    Decode(String),

    /// The `command` key is absent
    #[error("Message is missing the command key")]
    MissingCommand,

    /// The `command` value is not a recognized command code
    #[error("Unknown command code: {0}")]
    UnknownCommand(i64),
}

impl FrameError {
    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

/// Logical-connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No connection registered under the identifier
    #[error("No connection with identifier {identifier}")]
    NotFound { identifier: u32 },

    /// The connection (or its tunnel) is already closed
    #[error("Connection {identifier} is closed")]
    Closed { identifier: u32 },

    /// A known command arrived without a key it requires
    #[error("Message is missing required key '{key}'")]
    MissingKey { key: &'static str },

    /// `packets` and `protocols` lists differ in length
    #[error("Packet batch mismatch: {packets} packets, {protocols} protocols")]
    BatchMismatch { packets: usize, protocols: usize },
}

/// Flow relay errors, mapped onto wire result codes
#[derive(Debug, Error)]
pub enum RelayError {
    /// Host name did not resolve
    #[error("No such host: {host}")]
    NoSuchHost { host: String },

    /// Remote endpoint refused the connection
    #[error("Connection to {host}:{port} refused")]
    Refused { host: String, port: u16 },

    /// Remote connect timed out
    #[error("Connection to {host}:{port} timed out")]
    Timeout { host: String, port: u16 },

    /// The peer rejected the open parameters
    #[error("Peer rejected open parameters")]
    InvalidParameter,

    /// Internal relay failure (pool exhaustion, socket setup, ...)
    #[error("Internal relay error: {0}")]
    Internal(String),

    /// I/O error on the relay socket
    #[error("Relay I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl RelayError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The wire result code this error maps onto
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::NoSuchHost { .. } => ResultCode::NoSuchHost,
            Self::Refused { .. } => ResultCode::Refused,
            Self::Timeout { .. } => ResultCode::Timeout,
            Self::InvalidParameter => ResultCode::InvalidParameter,
            Self::Internal(_) | Self::IoError(_) => ResultCode::Internal,
        }
    }

    /// Reconstruct a relay error from a peer's failure result code
    #[must_use]
    pub fn from_result_code(code: ResultCode, host: &str, port: u16) -> Self {
        match code {
            ResultCode::NoSuchHost => Self::NoSuchHost { host: host.into() },
            ResultCode::Refused => Self::Refused {
                host: host.into(),
                port,
            },
            ResultCode::Timeout => Self::Timeout {
                host: host.into(),
                port,
            },
            ResultCode::InvalidParameter => Self::InvalidParameter,
            ResultCode::Success | ResultCode::Internal => {
                Self::Internal(format!("open failed with result code {code}"))
            }
        }
    }
}

/// Type alias for Result with [`TunnelError`]
pub type Result<T> = std::result::Result<T, TunnelError>;
