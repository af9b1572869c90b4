//! Upstream protocol session abstraction
//!
//! Defines the `Session` and `SessionFactory` traits that decouple the session
//! pool from the mail protocol. The pool only opens, probes, lends out, and
//! closes sessions; everything said over the connection belongs to the caller.
//!
//! `imap::ImapSessionFactory` is the production implementation: plain TCP or
//! TLS to an IMAP server, `LOGIN` on open, `NOOP` as the liveness probe and
//! `LOGOUT` on close.

pub mod error;
pub mod imap;

pub use error::{Result, SessionError};
pub use imap::{ImapConfig, ImapSession, ImapSessionFactory};

use common::Secret;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future used by the trait methods so both traits stay dyn-compatible
/// (`Arc<dyn SessionFactory>`, `Box<dyn Session>`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Login material for a brand-new session. Supplied by the caller on every
/// acquisition; the pool never stores it beyond the call.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Secret<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }
}

/// Completion status of a tagged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// Result of one tagged command: the untagged responses the server sent
/// before completion, in decoded form, and the completion text (`OK`, or the
/// server's text for `NO`/`BAD`).
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub untagged: Vec<String>,
    pub completion: String,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// An open, authenticated upstream session.
pub trait Session: Send {
    /// Liveness probe. Returns false once the connection is known to be dead.
    fn is_usable(&mut self) -> BoxFuture<'_, bool>;

    /// Graceful logout. The session must not be used afterwards.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Send one command (without tag) and collect the raw response.
    fn execute<'a>(&'a mut self, command: &'a str) -> BoxFuture<'a, Result<Response>>;

    /// Enter IDLE and wait up to `timeout` for a server push. Returns the
    /// updates received before the IDLE was terminated.
    fn idle(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// Opens authenticated sessions for an account.
pub trait SessionFactory: Send + Sync {
    fn open<'a>(
        &'a self,
        account: &'a str,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Box<dyn Session>>>;
}
