//! Error types shared by the data model and the control protocol.

use crate::messages::ErrorCode;
use crate::model::Key;
use thiserror::Error;

/// Result type for protocol parsing
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// A request or response that does not follow the `key=value` grammar.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Line without a `=` separator or with an empty key
    #[error("Malformed line: {0:?}")]
    MalformedLine(String),

    /// Request did not start with `get=` or `set=`
    #[error("Missing get/set command")]
    MissingCommand,

    /// First line named something other than `get` or `set`
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Key the service does not implement
    #[error("Unsupported key: {0}")]
    UnsupportedKey(String),

    /// Value that cannot be parsed for its key
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// Peer-scoped key appearing before any `public_key`
    #[error("Key {0} appears before any public_key")]
    PeerKeyWithoutPeer(String),

    /// Interface-scoped key appearing after a `public_key`
    #[error("Interface key {0} appears inside a peer section")]
    InterfaceKeyInPeer(String),

    /// Response without a leading `errno=` line
    #[error("Response is missing errno")]
    MissingErrno,
}

impl ProtocolError {
    /// Errno reported to the peer for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnsupportedKey(_) | ProtocolError::InvalidValue { .. } => {
                ErrorCode::Invalid
            }
            _ => ErrorCode::Protocol,
        }
    }

    pub(crate) fn invalid(key: &str, value: &str) -> Self {
        ProtocolError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Malformed configuration text or a control command that would produce an
/// invalid configuration. Scoped to the failing command or startup attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Malformed configuration: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("Duplicate peer public key {0}")]
    DuplicatePeer(Key),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigurationError {
    /// Errno reported on the control channel for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ConfigurationError::Malformed(e) => e.error_code(),
            _ => ErrorCode::Invalid,
        }
    }
}
