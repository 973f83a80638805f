//! Error taxonomy for the card core.
//!
//! Every failure is handled where it happens (return value + log). Nothing here
//! is fatal to the process; the category only drives structured logging and
//! the mapping to protocol error codes.

use thiserror::Error;

use crate::field::FieldId;

/// Error category for structured logging and protocol mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Write offset/length beyond a field's capacity
    OutOfBounds,
    /// Encoded tag payload would not fit the fixed buffer
    EncodingOverflow,
    /// Durable store read or write failed
    PersistenceFailure,
    /// Stopping, loading or starting tag emulation failed
    EmulationFailure,
    /// Configuration file or env misconfigured
    ConfigError,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutOfBounds => "OUT_OF_BOUNDS",
            Self::EncodingOverflow => "ENCODING_OVERFLOW",
            Self::PersistenceFailure => "PERSISTENCE_FAILURE",
            Self::EmulationFailure => "EMULATION_FAILURE",
            Self::ConfigError => "CONFIG_ERROR",
        }
    }
}

/// Rejected field mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("write out of bounds for {field}: offset {offset} + len {len} > max {max}")]
    OutOfBounds {
        field: FieldId,
        offset: usize,
        len: usize,
        max: usize,
    },
}

/// Tag payload encoding failure. The previously encoded payload is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("encoded message needs {needed} bytes, payload capacity is {capacity}")]
    PayloadOverflow { needed: usize, capacity: usize },

    #[error("message already holds the maximum of {max} records")]
    TooManyRecords { max: usize },
}

/// Durable store failure.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown key: {key}")]
    UnknownKey { key: String },

    #[error("value for {key} is {len} bytes, limit is {max}")]
    ValueTooLong { key: String, len: usize, max: usize },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Tag emulation port failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmulationError {
    #[error("failed to stop emulation: {0}")]
    Stop(String),

    #[error("failed to set payload: {0}")]
    SetPayload(String),

    #[error("failed to start emulation: {0}")]
    Start(String),
}

/// Configuration failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
