//! Provider errors, classified by [`ErrorKind`].

use rack_core::ErrorKind;
use rackplane_stream::StreamError;
use rackplane_substrate::SubstrateError;
use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InUse(String),

    #[error("{0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Deliberately carries no detail.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("canceled")]
    Canceled,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InUse(_) => ErrorKind::InUse,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::DecryptionFailed => ErrorKind::DecryptionFailed,
            Self::Throttled(_) => ErrorKind::Throttled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Canceled => ErrorKind::Canceled,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Substrate code used when a call outlives its deadline.
pub const DEADLINE_CODE: &str = "RequestTimeout";

impl From<SubstrateError> for ProviderError {
    fn from(err: SubstrateError) -> Self {
        let message = err.to_string();
        match &err {
            SubstrateError::Canceled => Self::Canceled,
            SubstrateError::Transport(m) => Self::Unavailable(m.clone()),
            SubstrateError::Api { code, message: detail } => match code.as_str() {
                DEADLINE_CODE => Self::Timeout(detail.clone()),
                "ThrottlingException" | "Throttling" | "RequestLimitExceeded" => Self::Throttled(message),
                "NoSuchKey" | "NotFound" | "ResourceNotFoundException" | "RepositoryNotFoundException" => {
                    Self::NotFound(message)
                }
                "ValidationError" if err.is_missing_stack() => Self::NotFound(message),
                "ValidationError" | "ValidationException" | "InvalidParameterException" | "ClientException" => {
                    Self::Validation(message)
                }
                c if c.starts_with("AccessDenied") || c.starts_with("UnrecognizedClient") => {
                    Self::Unauthorized(message)
                }
                "ServiceUnavailable" | "InternalFailure" | "InternalServerError" => Self::Unavailable(message),
                _ => Self::Internal(message),
            },
        }
    }
}

impl From<StreamError> for ProviderError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::ConnectTimeout(address) => Self::Timeout(format!("connect to {address}")),
            StreamError::Connect { .. } => Self::Unavailable(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
