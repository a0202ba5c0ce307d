//! SQLite journal for the Eurasia archive.
//!
//! Wraps [`tokio_rusqlite`] so every committed change is written on a
//! dedicated thread without blocking the async runtime. The journal stores
//! current rows, not history: reopening an archive loads the rows back and
//! re-verifies them through [`eurasia_core::Archive::restore`].

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteJournal;
