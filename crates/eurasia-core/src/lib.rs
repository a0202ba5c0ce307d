//! Core engine for the medieval Eurasia archive.
//!
//! Typed entities, catalog-driven relations between them, and hierarchy
//! forests over locations, knowledge forms and lexicon terms. Storage is
//! pluggable through the [`Journal`](journal::Journal) trait; this crate
//! has no database dependency.

pub mod archive;
pub mod dump;
pub mod entity;
pub mod error;
pub mod hierarchy;
pub mod import;
mod integrity;
pub mod journal;
pub mod query;
pub mod relation;
pub mod schema;
pub mod traverse;

pub use archive::Archive;
pub use error::{Error, ErrorClass, Result};

#[cfg(test)]
mod tests;
