//! Errors returned by substrate calls.

use thiserror::Error;

pub type SubstrateResult<T> = Result<T, SubstrateError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubstrateError {
    /// The substrate answered with an error code.
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    #[error("request canceled")]
    Canceled,

    /// The request never got an answer.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SubstrateError {
    pub fn api(code: &str, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Substrate error code, if the substrate answered.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Api { message, .. } => message,
            Self::Canceled => "canceled",
            Self::Transport(m) => m,
        }
    }

    pub fn is_code(&self, code: &str) -> bool {
        self.code() == Some(code)
    }

    /// Missing stacks surface as `ValidationError` with a "does not exist" message.
    pub fn is_missing_stack(&self) -> bool {
        self.is_code("ValidationError") && self.message().contains("does not exist")
    }
}
