//! Common types shared by the IMAP pool workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
