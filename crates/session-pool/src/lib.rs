//! Per-account pool of authenticated IMAP sessions
//!
//! Mail providers cap concurrent connections per account, and logging in is
//! slow. The pool keeps a bounded set of sessions per account and lends them
//! out one caller at a time:
//!
//! 1. `Pool::acquire` reuses an idle Transient session after a liveness
//!    probe, or opens a new one while the account is under its cap
//! 2. A saturated account makes Transient callers wait for a release, then
//!    fail with `PoolExhausted`
//! 3. Push callers (long-lived IDLE) always get their own session, evicting
//!    the least recently released idle one or overflowing the cap by one
//! 4. `Pool::release` (or dropping the `Lease`) makes a Transient session
//!    idle again; a Push session is logged out and its slot freed
//! 5. The reaper closes sessions idle too long or older than the max age
//! 6. `Pool::shutdown` logs out everything idle and refuses new work
//!
//! No network I/O happens while an account's lock is held.

mod admission;
pub mod config;
pub mod error;
mod eviction;
pub mod metrics;
pub mod pool;
mod reaper;
pub mod registry;
pub mod stats;

#[cfg(test)]
mod testing;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use imap_session::Credentials;
pub use pool::{Lease, Pool};
pub use registry::{CloseReason, Purpose, SlotId};
pub use stats::{AccountStats, PoolStats};
