//! Error types for pool operations

use imap_session::SessionError;

/// Errors surfaced to callers of the pool.
///
/// Stale reused sessions and failed logouts never appear here; the pool
/// absorbs them. Only conditions that leave the caller without a usable
/// session are returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The upstream rejected the caller's credentials. Never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A brand-new session could not be opened.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("pool exhausted for {account}: {slots} of {max} slots busy")]
    PoolExhausted {
        account: String,
        slots: usize,
        max: usize,
    },

    #[error("pool is shut down")]
    Closed,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the caller may reasonably try the same acquisition again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. } | Error::Transport(_))
    }

    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Authentication(_) => "authentication",
            Error::Transport(_) => "transport",
            Error::PoolExhausted { .. } => "exhausted",
            Error::Closed => "closed",
            Error::InvalidConfig(_) => "config",
        }
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Authentication(msg) => Error::Authentication(msg),
            other => Error::Transport(other.to_string()),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
