use thiserror::Error;

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// The session ended without reporting an exit status.
    #[error("session ended without exit status: {0}")]
    NoExit(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
