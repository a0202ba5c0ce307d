//! Entities: the typed records of the archive.
//!
//! Every entity belongs to exactly one [`EntityKind`] and is addressed by a
//! [`Uid`] that is unique within that kind. Attributes are free-form JSON;
//! the engine only cares about identity and references.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{Error, Result};

/// Free-form attribute map carried by entities, relations and nodes.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

// ─── Kinds ───────────────────────────────────────────────────────────────────

/// The kind of record an entity represents.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumIter,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
  Individual,
  Source,
  Location,
  ClassicalSource,
  SocialRole,
  Honorific,
  KnowledgeForm,
  LexiconTerm,
  Repository,
  Territory,
  Power,
  Epoch,
  Bibliography,
}

impl EntityKind {
  /// Name of the table this kind was catalogued in.
  pub fn table(self) -> &'static str {
    match self {
      Self::Individual => "individuals",
      Self::Source => "sources",
      Self::Location => "gazetteer",
      Self::ClassicalSource => "classical_sources",
      Self::SocialRole => "social_roles",
      Self::Honorific => "honorifics",
      Self::KnowledgeForm => "knowledge_forms",
      Self::LexiconTerm => "lexicon",
      Self::Repository => "repositories",
      Self::Territory => "territories",
      Self::Power => "powers",
      Self::Epoch => "epochs",
      Self::Bibliography => "bibliography",
    }
  }

  /// Shorthand for an [`EntityRef`] of this kind.
  pub fn at(self, uid: Uid) -> EntityRef { EntityRef { kind: self, uid } }
}

// ─── Identity ────────────────────────────────────────────────────────────────

/// A stable identifier, unique per entity kind (or per hierarchy table).
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Default,
  Serialize,
  Deserialize,
)]
#[serde(transparent)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<u64> for Uid {
  fn from(value: u64) -> Self { Self(value) }
}

/// A typed pointer to an entity: the pair every foreign key resolves to.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityRef {
  pub kind: EntityKind,
  pub uid:  Uid,
}

impl fmt::Display for EntityRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.kind, self.uid)
  }
}

// ─── Entity ──────────────────────────────────────────────────────────────────

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
  pub kind:       EntityKind,
  pub uid:        Uid,
  /// Starts at 1; bumped by every successful update.
  pub version:    u64,
  pub attributes: Attributes,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Entity {
  pub(crate) fn new(kind: EntityKind, uid: Uid, attributes: Attributes) -> Self {
    let now = Utc::now();
    Self {
      kind,
      uid,
      version: 1,
      attributes,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn reference(&self) -> EntityRef { self.kind.at(self.uid) }

  /// String value of an attribute, if present and a string.
  pub fn text(&self, field: &str) -> Option<&str> {
    self.attributes.get(field).and_then(serde_json::Value::as_str)
  }
}

// ─── Table ───────────────────────────────────────────────────────────────────

/// All live entities of one kind, plus the kind's UID allocator.
///
/// Backed by persistent maps so a committed table can be cloned and edited
/// without disturbing readers of the previous snapshot.
#[derive(Debug, Clone, Default)]
pub struct EntityTable {
  rows:     im::OrdMap<Uid, Arc<Entity>>,
  next_uid: u64,
}

impl EntityTable {
  pub fn get(&self, uid: Uid) -> Option<&Arc<Entity>> { self.rows.get(&uid) }

  pub fn contains(&self, uid: Uid) -> bool { self.rows.contains_key(&uid) }

  pub fn len(&self) -> usize { self.rows.len() }

  pub fn is_empty(&self) -> bool { self.rows.is_empty() }

  /// Entities in UID order.
  pub fn iter(&self) -> impl Iterator<Item = &Arc<Entity>> { self.rows.values() }

  /// The UID the next [`allocate`](Self::allocate) call will hand out.
  pub fn next_uid(&self) -> u64 { self.next_uid.max(1) }

  /// Hand out a fresh UID. UIDs are never reissued, even after deletes.
  ///
  /// `put` keeps the allocator above every stored UID, so any value below
  /// `u64::MAX` is free; once it reaches `u64::MAX` the kind is full.
  pub(crate) fn allocate(&mut self, kind: EntityKind) -> Result<Uid> {
    let uid = self.next_uid();
    self.next_uid = uid
      .checked_add(1)
      .ok_or_else(|| Error::Exhausted(format!("{kind} uids")))?;
    Ok(Uid(uid))
  }

  /// Raise the allocator to at least `next`.
  pub(crate) fn reserve(&mut self, next: u64) {
    self.next_uid = self.next_uid.max(next);
  }

  /// Insert or replace a row, keeping the allocator ahead of its UID.
  pub(crate) fn put(&mut self, entity: Arc<Entity>) {
    self.reserve(entity.uid.0.saturating_add(1));
    self.rows.insert(entity.uid, entity);
  }

  pub(crate) fn remove(&mut self, uid: Uid) -> Option<Arc<Entity>> {
    self.rows.remove(&uid)
  }
}
