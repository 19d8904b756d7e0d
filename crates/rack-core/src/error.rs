//! Error taxonomy shared by every layer.
//!
//! Errors are classified by kind, not by message text. Each crate keeps its
//! own `thiserror` enum and reports its kind through a `kind()` method.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Entity absent.
    NotFound,
    /// Structural mutation attempted while one is already in flight.
    Conflict,
    /// Delete attempted on an entity with live references.
    InUse,
    /// Caller-supplied data failed constraints.
    Validation,
    Unauthorized,
    /// Envelope open failed. Carries no detail.
    DecryptionFailed,
    Throttled,
    Timeout,
    Canceled,
    /// Transient substrate failure.
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Whether a worker should retry the operation on its next attempt.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Throttled | Self::Unavailable | Self::Conflict)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InUse => "in_use",
            Self::Validation => "validation",
            Self::Unauthorized => "unauthorized",
            Self::DecryptionFailed => "decryption_failed",
            Self::Throttled => "throttled",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
