//! Read-only reporting over committed snapshots: the table overview,
//! distinct attribute values, and regex search.

use std::collections::{BTreeSet, HashSet};

use regex::Regex;
use serde::Serialize;
use strum::IntoEnumIterator;

use crate::{
  Archive, Error, Result,
  entity::{Entity, EntityKind, Uid},
  journal::Journal,
  relation::Direction,
  schema::{HierarchyTable, RelationType, TableId},
};

/// One foreign-key column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
  pub column:    &'static str,
  pub target:    EntityKind,
  pub mandatory: bool,
}

/// One row of [`Archive::catalog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
  pub name:         &'static str,
  #[serde(skip)]
  pub table:        TableId,
  pub rows:         usize,
  pub foreign_keys: Vec<ForeignKey>,
}

/// The far end of the join in [`Archive::find_linked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget<'a> {
  /// One entity, by UID.
  Uid(Uid),
  /// Every entity with a string attribute matching this regex.
  Pattern(&'a str),
}

impl<J: Journal> Archive<J> {
  /// Every table with its current row count and foreign-key columns.
  pub fn catalog(&self) -> Vec<TableSummary> {
    let entities = EntityKind::iter().map(|kind| TableSummary {
      name:         kind.table(),
      table:        TableId::Entity(kind),
      rows:         self.entity_table(kind).len(),
      foreign_keys: Vec::new(),
    });

    let relations = RelationType::iter().map(|t| {
      let schema = t.schema();
      let mut foreign_keys = vec![
        ForeignKey { column: "from", target: schema.from, mandatory: true },
        ForeignKey { column: "to", target: schema.to, mandatory: true },
      ];
      foreign_keys.extend(schema.slots.iter().map(|s| ForeignKey {
        column:    s.name,
        target:    s.kind,
        mandatory: s.mandatory,
      }));
      TableSummary {
        name: t.into(),
        table: TableId::Relation(t),
        rows: self.relation_table(t).len(),
        foreign_keys,
      }
    });

    let hierarchies = HierarchyTable::iter().map(|h| TableSummary {
      name:         h.into(),
      table:        TableId::Hierarchy(h),
      rows:         self.forest(h).len(),
      foreign_keys: vec![
        ForeignKey { column: "uid", target: h.member(), mandatory: true },
        ForeignKey { column: "parent", target: h.member(), mandatory: false },
      ],
    });

    entities.chain(relations).chain(hierarchies).collect()
  }

  /// Distinct string forms of `field` across all entities of `kind`,
  /// sorted. Entities without the field are skipped.
  pub fn distinct_values(&self, kind: EntityKind, field: &str) -> Vec<String> {
    let values: BTreeSet<String> = self
      .entity_table(kind)
      .iter()
      .filter_map(|e| e.attributes.get(field))
      .filter(|v| !v.is_null())
      .map(|v| match v.as_str() {
        Some(s) => s.to_owned(),
        None => v.to_string(),
      })
      .collect();
    values.into_iter().collect()
  }

  /// Entities of `kind` with at least one of `fields` matching `pattern`,
  /// in UID order. An empty `fields` searches every string attribute.
  pub fn find(
    &self,
    kind: EntityKind,
    fields: &[&str],
    pattern: &str,
  ) -> Result<Vec<Entity>> {
    let regex = Regex::new(pattern)?;
    let matches = |entity: &Entity| {
      if fields.is_empty() {
        entity
          .attributes
          .values()
          .filter_map(serde_json::Value::as_str)
          .any(|text| regex.is_match(text))
      } else {
        fields
          .iter()
          .filter_map(|f| entity.text(f))
          .any(|text| regex.is_match(text))
      }
    };

    Ok(
      self
        .entity_table(kind)
        .iter()
        .filter(|e| matches(e))
        .map(|e| (**e).clone())
        .collect(),
    )
  }

  /// [`find`](Self::find), keeping only entities joined through
  /// `relation_type` to an entity selected by `target`.
  ///
  /// `kind` is matched against the relation's `from` side first, then its
  /// `to` side, so a relation joining a kind to itself is followed
  /// outgoing.
  pub fn find_linked(
    &self,
    kind: EntityKind,
    fields: &[&str],
    pattern: &str,
    relation_type: RelationType,
    target: LinkTarget<'_>,
  ) -> Result<Vec<Entity>> {
    let schema = relation_type.schema();
    let (direction, far) = if schema.from == kind {
      (Direction::Outgoing, schema.to)
    } else if schema.to == kind {
      (Direction::Incoming, schema.from)
    } else {
      return Err(Error::NotFound(format!("{relation_type} does not join {kind}")));
    };

    let targets: HashSet<Uid> = match target {
      LinkTarget::Uid(uid) => HashSet::from([uid]),
      LinkTarget::Pattern(p) => {
        self.find(far, &[], p)?.into_iter().map(|e| e.uid).collect()
      }
    };
    let edges = self.relation_table(relation_type);
    let linked = |entity: &Entity| {
      edges.incident(entity.reference(), direction).any(|r| {
        let end = match direction {
          Direction::Outgoing => r.to,
          Direction::Incoming => r.from,
        };
        targets.contains(&end.uid)
      })
    };

    let mut found = self.find(kind, fields, pattern)?;
    found.retain(|e| linked(e));
    Ok(found)
  }
}
