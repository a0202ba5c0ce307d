//! The durability seam.
//!
//! Every committed mutation is described by exactly one [`Change`] and handed
//! to the archive's [`Journal`] before it becomes visible. Backends (e.g.
//! `eurasia-store-sqlite`) implement the trait; the core never depends on a
//! concrete backend.

use std::{convert::Infallible, future::Future};

use serde::{Deserialize, Serialize};

use crate::{
  entity::{Entity, EntityRef, Uid},
  hierarchy::HierarchyNode,
  relation::{Relation, RelationHandle},
  schema::HierarchyTable,
};

/// A single committed row-level change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
  /// Insert or replace an entity row.
  PutEntity { entity: Entity },
  DeleteEntity { entity: EntityRef },
  /// Insert a relation row. Relations are never updated in place.
  PutRelation { relation: Relation },
  DeleteRelation { handle: RelationHandle },
  /// Insert or replace a hierarchy row (attach, detach and reparent).
  PutNode { node: HierarchyNode },
  DeleteNode { table: HierarchyTable, uid: Uid },
}

/// Receives committed changes before they are published to readers.
///
/// If `commit` fails the archive discards the mutation and reports
/// [`crate::Error::StorageFailure`]; the journal must therefore apply each
/// change atomically or not at all.
pub trait Journal: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn commit(
    &self,
    change: Change,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// A journal that keeps nothing; the archive lives only in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullJournal;

impl Journal for NullJournal {
  type Error = Infallible;

  async fn commit(&self, _change: Change) -> Result<(), Infallible> { Ok(()) }
}
