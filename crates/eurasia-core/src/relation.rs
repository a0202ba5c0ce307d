//! Relations: typed, directed, attributed edges between entities.
//!
//! A relation table keeps its edges in insertion order together with three
//! reverse indices: outgoing (by `from`), incoming (by `to`), and a
//! referrer index covering every column, which the delete check consults.

use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  entity::{Attributes, EntityKind, EntityRef, Uid},
  schema::RelationType,
};

/// Values of a relation's extra reference slots, keyed by slot name.
pub type Refs = BTreeMap<String, EntityRef>;

/// Identifies one stored edge. Handles are never reused within a table.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RelationHandle {
  pub relation_type: RelationType,
  pub id:            u64,
}

impl fmt::Display for RelationHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.relation_type, self.id)
  }
}

/// Which end of an edge a neighbor query starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  /// Follow edges from `from` to `to`.
  #[default]
  Outgoing,
  /// Follow edges backwards, from `to` to `from`.
  Incoming,
}

// ─── Relation ────────────────────────────────────────────────────────────────

/// A stored edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
  pub handle:      RelationHandle,
  pub from:        EntityRef,
  pub to:          EntityRef,
  #[serde(default)]
  pub refs:        Refs,
  #[serde(default)]
  pub attributes:  Attributes,
  pub recorded_at: DateTime<Utc>,
}

impl Relation {
  /// Every entity this edge points at, including slot references.
  pub fn referenced(&self) -> impl Iterator<Item = EntityRef> + '_ {
    [self.from, self.to]
      .into_iter()
      .chain(self.refs.values().copied())
  }

  fn same_tuple(&self, input: &NewRelation) -> bool {
    self.from == input.from
      && self.to == input.to
      && self.refs == input.refs
      && self.attributes == input.attributes
  }
}

// ─── NewRelation ─────────────────────────────────────────────────────────────

/// Input to [`crate::Archive::link`].
#[derive(Debug, Clone)]
pub struct NewRelation {
  pub relation_type: RelationType,
  pub from:          EntityRef,
  pub to:            EntityRef,
  pub refs:          Refs,
  pub attributes:    Attributes,
}

impl NewRelation {
  /// An edge with no slot references and no attributes.
  pub fn new(relation_type: RelationType, from: EntityRef, to: EntityRef) -> Self {
    Self {
      relation_type,
      from,
      to,
      refs: Refs::new(),
      attributes: Attributes::new(),
    }
  }

  pub fn with_ref(mut self, slot: impl Into<String>, target: EntityRef) -> Self {
    self.refs.insert(slot.into(), target);
    self
  }

  pub fn with_attributes(mut self, attributes: Attributes) -> Self {
    self.attributes = attributes;
    self
  }
}

// ─── Table ───────────────────────────────────────────────────────────────────

/// All edges of one relation type.
#[derive(Debug, Clone, Default)]
pub struct RelationTable {
  edges:     im::OrdMap<u64, Arc<Relation>>,
  outgoing:  im::HashMap<EntityRef, im::OrdSet<u64>>,
  incoming:  im::HashMap<EntityRef, im::OrdSet<u64>>,
  referrers: im::HashMap<EntityRef, im::OrdSet<u64>>,
  next_id:   u64,
}

impl RelationTable {
  pub fn get(&self, id: u64) -> Option<&Arc<Relation>> { self.edges.get(&id) }

  pub fn len(&self) -> usize { self.edges.len() }

  pub fn is_empty(&self) -> bool { self.edges.is_empty() }

  /// Edges in insertion order.
  pub fn iter(&self) -> impl Iterator<Item = &Arc<Relation>> { self.edges.values() }

  pub fn next_id(&self) -> u64 { self.next_id.max(1) }

  /// Number of edges with any column pointing at `entity`.
  pub fn dependents(&self, entity: EntityRef) -> usize {
    self.referrers.get(&entity).map_or(0, im::OrdSet::len)
  }

  /// An existing edge carrying exactly the tuple in `input`.
  pub fn find_duplicate(&self, input: &NewRelation) -> Option<&Arc<Relation>> {
    self
      .outgoing
      .get(&input.from)?
      .iter()
      .filter_map(|id| self.edges.get(id))
      .find(|r| r.same_tuple(input))
  }

  /// Edge ids incident to `entity` in the given direction, in insertion
  /// order.
  pub fn incident(
    &self,
    entity: EntityRef,
    direction: Direction,
  ) -> impl Iterator<Item = &Arc<Relation>> {
    let index = match direction {
      Direction::Outgoing => &self.outgoing,
      Direction::Incoming => &self.incoming,
    };
    index
      .get(&entity)
      .into_iter()
      .flat_map(|ids| ids.iter())
      .filter_map(|id| self.edges.get(id))
  }

  pub(crate) fn allocate(&mut self, relation_type: RelationType) -> Result<u64> {
    let id = self.next_id();
    self.next_id = id
      .checked_add(1)
      .ok_or_else(|| Error::Exhausted(format!("{relation_type} handles")))?;
    Ok(id)
  }

  pub(crate) fn reserve(&mut self, next: u64) {
    self.next_id = self.next_id.max(next);
  }

  pub(crate) fn insert(&mut self, relation: Arc<Relation>) {
    let id = relation.handle.id;
    self.reserve(id.saturating_add(1));
    self.outgoing.entry(relation.from).or_default().insert(id);
    self.incoming.entry(relation.to).or_default().insert(id);
    for target in relation.referenced() {
      self.referrers.entry(target).or_default().insert(id);
    }
    self.edges.insert(id, relation);
  }

  pub(crate) fn remove(&mut self, id: u64) -> Option<Arc<Relation>> {
    let relation = self.edges.remove(&id)?;
    detach_id(&mut self.outgoing, relation.from, id);
    detach_id(&mut self.incoming, relation.to, id);
    for target in relation.referenced() {
      detach_id(&mut self.referrers, target, id);
    }
    Some(relation)
  }
}

fn detach_id(
  index: &mut im::HashMap<EntityRef, im::OrdSet<u64>>,
  key: EntityRef,
  id: u64,
) {
  if let Some(ids) = index.get_mut(&key) {
    ids.remove(&id);
    if ids.is_empty() {
      index.remove(&key);
    }
  }
}

// ─── Neighbors ───────────────────────────────────────────────────────────────

/// The neighbors of one entity along one relation type, taken from a
/// committed snapshot.
///
/// The view is lazy and restartable: every call to [`iter`](Self::iter)
/// walks the same snapshot from the start, in edge insertion order.
#[derive(Debug, Clone)]
pub struct Neighbors {
  table:         Arc<RelationTable>,
  relation_type: RelationType,
  entity:        EntityRef,
  direction:     Direction,
}

impl Neighbors {
  pub(crate) fn new(
    table: Arc<RelationTable>,
    relation_type: RelationType,
    entity: EntityRef,
    direction: Direction,
  ) -> Self {
    Self { table, relation_type, entity, direction }
  }

  /// Kind of the entities this view yields.
  pub fn kind(&self) -> EntityKind {
    let schema = self.relation_type.schema();
    match self.direction {
      Direction::Outgoing => schema.to,
      Direction::Incoming => schema.from,
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = Uid> + '_ {
    let direction = self.direction;
    self
      .table
      .incident(self.entity, direction)
      .map(move |r| match direction {
        Direction::Outgoing => r.to.uid,
        Direction::Incoming => r.from.uid,
      })
  }

  pub fn to_vec(&self) -> Vec<Uid> { self.iter().collect() }

  pub fn is_empty(&self) -> bool { self.iter().next().is_none() }
}
