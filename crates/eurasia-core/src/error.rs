//! Error types for `eurasia-core`.

use thiserror::Error;

use crate::{
  entity::{EntityKind, EntityRef, Uid},
  schema::{HierarchyTable, RelationType},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("duplicate key: {0}")]
  DuplicateKey(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("unknown entity: {0}")]
  UnknownEntity(EntityRef),

  #[error("{relation}.{slot} expects {expected}, got {found}")]
  KindMismatch {
    relation: RelationType,
    slot:     &'static str,
    expected: EntityKind,
    found:    EntityRef,
  },

  #[error("{relation}.{slot} is mandatory")]
  MissingReference {
    relation: RelationType,
    slot:     &'static str,
  },

  #[error("{relation} declares no reference slot {slot:?}")]
  UnexpectedReference { relation: RelationType, slot: String },

  #[error("attaching {child} under {parent} in {table} would create a cycle")]
  CycleDetected {
    table:  HierarchyTable,
    parent: Uid,
    child:  Uid,
  },

  #[error("no path between {from} and {to} in {table}")]
  NoPath {
    table: HierarchyTable,
    from:  Uid,
    to:    Uid,
  },

  #[error("{entity} is still referenced by {dependents} row(s)")]
  ReferentialIntegrityViolation { entity: EntityRef, dependents: usize },

  /// A UID, handle or sequence counter reached `u64::MAX`.
  #[error("identifier space exhausted: {0}")]
  Exhausted(String),

  #[error("storage failure: {0}")]
  StorageFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("invalid pattern: {0}")]
  InvalidPattern(#[from] regex::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Coarse grouping of [`Error`] variants for callers deciding whether to
/// retry, reorder, or abandon an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// The input referenced something that does not exist (yet).
  MissingInput,
  /// The mutation would corrupt a hierarchy.
  Corruption,
  /// The mutation would orphan other rows.
  Orphaning,
  /// The key is already taken.
  Conflict,
  /// The backing store failed; the operation had no effect.
  Storage,
  /// The input is malformed and will never succeed as given.
  Input,
}

impl Error {
  pub fn class(&self) -> ErrorClass {
    match self {
      Self::NotFound(_) | Self::UnknownEntity(_) | Self::NoPath { .. } => {
        ErrorClass::MissingInput
      }
      Self::CycleDetected { .. } => ErrorClass::Corruption,
      Self::ReferentialIntegrityViolation { .. } => ErrorClass::Orphaning,
      Self::DuplicateKey(_) | Self::Exhausted(_) => ErrorClass::Conflict,
      Self::StorageFailure(_) => ErrorClass::Storage,
      Self::KindMismatch { .. }
      | Self::MissingReference { .. }
      | Self::UnexpectedReference { .. }
      | Self::InvalidPattern(_)
      | Self::Serialization(_) => ErrorClass::Input,
    }
  }

  pub(crate) fn storage(
    err: impl std::error::Error + Send + Sync + 'static,
  ) -> Self {
    Self::StorageFailure(Box::new(err))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
