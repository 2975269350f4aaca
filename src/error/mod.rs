//! This module defines the errors that can be returned by gtstore components.
use std::fmt::Display;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Error enum with all possible variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Error {
    /// Key is empty or larger than the per-request bound
    BadKey { reason: String },
    /// Serialized value is larger than the per-request bound
    BadValue { reason: String },
    /// Payload did not match the expected grammar
    BadFormat { reason: String },
    /// Another writer currently holds the per-key lock on the primary
    Locked { key: String },
    /// The node is paused by the manager and refuses client traffic
    NodePaused,
    /// Variant returned for GET requests when the key is not present
    NotFound { key: String },
    /// Socket or framing failure
    Transport { reason: String },
    /// Message type id that is not part of the protocol
    UnknownType { id: u16 },
    /// Logic is a type of error that signifies a bug in the database.
    Logic { reason: String },
}

impl Error {
    /// Short reason string carried in the payload of `ERROR` replies.
    pub fn wire_reason(&self) -> &'static str {
        match self {
            Error::BadKey { .. } => "bad key",
            Error::BadValue { .. } => "bad value",
            Error::BadFormat { .. } => "bad format",
            Error::Locked { .. } => "locked",
            Error::NodePaused => "node paused",
            Error::NotFound { .. } => "missing",
            Error::Transport { .. } => "transport",
            Error::UnknownType { .. } => "unknown",
            Error::Logic { .. } => "internal",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Transport {
            reason: err.to_string(),
        }
    }
}
