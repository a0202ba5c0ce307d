//! Integrity rules: which tables a mutation must lock, and the checks it
//! must pass before anything is written.
//!
//! All checks here are pure functions over committed snapshots. The archive
//! runs them while holding the writer locks returned by the `*_tables`
//! planners, so the snapshots cannot change underneath a check.

use std::collections::BTreeSet;

use strum::IntoEnumIterator;
use tokio::sync::OwnedMutexGuard;

use crate::{
  Error, Result,
  entity::{EntityKind, EntityRef},
  hierarchy::Forest,
  relation::{NewRelation, RelationTable},
  schema::{HierarchyTable, RelationType, TableId},
};

// ─── Lock planning ───────────────────────────────────────────────────────────

/// Writer locks held for the duration of one mutation. Acquired in
/// [`TableId`] order; released on drop.
pub(crate) struct WriteSet {
  _guards: Vec<OwnedMutexGuard<()>>,
}

impl WriteSet {
  pub(crate) fn new(guards: Vec<OwnedMutexGuard<()>>) -> Self {
    Self { _guards: guards }
  }
}

/// Creating or updating an entity only touches its own table.
pub(crate) fn entity_write_tables(kind: EntityKind) -> BTreeSet<TableId> {
  BTreeSet::from([TableId::Entity(kind)])
}

/// Deleting an entity must freeze every table that could reference it.
pub(crate) fn entity_delete_tables(kind: EntityKind) -> BTreeSet<TableId> {
  let mut tables = entity_write_tables(kind);
  tables.extend(RelationType::referencing(kind).map(TableId::Relation));
  tables.extend(
    HierarchyTable::iter()
      .filter(|h| h.member() == kind)
      .map(TableId::Hierarchy),
  );
  tables
}

/// Linking freezes the relation table and every kind it points at, so no
/// endpoint can be deleted while the link is validated.
pub(crate) fn relation_tables(relation_type: RelationType) -> BTreeSet<TableId> {
  let mut tables = BTreeSet::from([TableId::Relation(relation_type)]);
  tables.extend(
    relation_type
      .schema()
      .referenced_kinds()
      .map(TableId::Entity),
  );
  tables
}

pub(crate) fn hierarchy_tables(table: HierarchyTable) -> BTreeSet<TableId> {
  BTreeSet::from([
    TableId::Entity(table.member()),
    TableId::Hierarchy(table),
  ])
}

// ─── Checks ──────────────────────────────────────────────────────────────────

/// Validate a prospective edge against the catalog and entity existence.
///
/// Shape problems (wrong kinds, missing or undeclared slots) are reported
/// before existence, so a malformed request never looks like a reorderable
/// one.
pub(crate) fn check_relation(
  input: &NewRelation,
  exists: impl Fn(EntityRef) -> bool,
) -> Result<()> {
  let schema = input.relation_type.schema();
  let relation = input.relation_type;

  expect_kind(relation, "from", schema.from, input.from)?;
  expect_kind(relation, "to", schema.to, input.to)?;

  if let Some(slot) = input.refs.keys().find(|name| schema.slot(name).is_none()) {
    return Err(Error::UnexpectedReference { relation, slot: slot.clone() });
  }
  for slot in schema.slots {
    match input.refs.get(slot.name) {
      Some(target) => expect_kind(relation, slot.name, slot.kind, *target)?,
      None if slot.mandatory => {
        return Err(Error::MissingReference { relation, slot: slot.name });
      }
      None => {}
    }
  }

  let targets = [input.from, input.to]
    .into_iter()
    .chain(input.refs.values().copied());
  for target in targets {
    if !exists(target) {
      return Err(Error::UnknownEntity(target));
    }
  }
  Ok(())
}

fn expect_kind(
  relation: RelationType,
  slot: &'static str,
  expected: EntityKind,
  found: EntityRef,
) -> Result<()> {
  if found.kind == expected {
    Ok(())
  } else {
    Err(Error::KindMismatch { relation, slot, expected, found })
  }
}

/// Count rows in the given relation tables and forests that reference
/// `entity`.
pub(crate) fn dependents<'a>(
  entity: EntityRef,
  relations: impl IntoIterator<Item = &'a RelationTable>,
  forests: impl IntoIterator<Item = &'a Forest>,
) -> usize {
  let edges: usize = relations.into_iter().map(|t| t.dependents(entity)).sum();
  let nodes = forests
    .into_iter()
    .filter(|f| f.table().member() == entity.kind && f.contains(entity.uid))
    .count();
  edges + nodes
}

/// Re-verify the structural invariants of a forest loaded from storage.
pub(crate) fn check_forest(
  forest: &Forest,
  member_exists: impl Fn(EntityRef) -> bool,
) -> Result<()> {
  let table = forest.table();
  for node in forest.nodes() {
    let member = table.member().at(node.uid);
    if !member_exists(member) {
      return Err(Error::UnknownEntity(member));
    }
    let Some(parent) = node.parent else { continue };
    if !forest.contains(parent) {
      return Err(Error::UnknownEntity(table.member().at(parent)));
    }
    if forest.is_self_or_ancestor(node.uid, parent) {
      return Err(Error::CycleDetected { table, parent, child: node.uid });
    }
  }
  Ok(())
}
