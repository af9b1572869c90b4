//! Error types for upstream session operations

/// Errors from opening or driving an upstream protocol session.
///
/// The pool treats these as opaque apart from the variant: `Authentication`
/// is surfaced to the caller verbatim, `Transport` marks a dead connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
