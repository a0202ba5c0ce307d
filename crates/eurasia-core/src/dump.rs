//! Whole-archive snapshots, for export and for restoring from a journal.

use std::{collections::{BTreeMap, HashMap, HashSet}, sync::Arc};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
  Archive, Error, Result,
  entity::{EntityKind, EntityRef, EntityTable, Entity},
  hierarchy::{Forest, HierarchyNode},
  integrity,
  journal::Journal,
  relation::{NewRelation, Relation, RelationTable},
  schema::{HierarchyTable, RelationType},
};

/// Allocator positions. Restored alongside the rows so that identifiers
/// handed out before a restart are never handed out again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
  #[serde(default)]
  pub entities:  BTreeMap<EntityKind, u64>,
  #[serde(default)]
  pub relations: BTreeMap<RelationType, u64>,
  #[serde(default)]
  pub nodes:     BTreeMap<HierarchyTable, u64>,
}

/// Every live row of an archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dump {
  pub entities:  Vec<Entity>,
  pub relations: Vec<Relation>,
  pub nodes:     Vec<HierarchyNode>,
  #[serde(default)]
  pub counters:  Counters,
}

impl<J: Journal> Archive<J> {
  /// Copy out every committed row. Each table is read from its own
  /// snapshot, so a dump taken under concurrent writes is consistent per
  /// table only.
  pub fn dump(&self) -> Dump {
    let mut dump = Dump::default();
    for kind in EntityKind::iter() {
      let table = self.entity_table(kind);
      dump.entities.extend(table.iter().map(|e| (**e).clone()));
      dump.counters.entities.insert(kind, table.next_uid());
    }
    for relation_type in RelationType::iter() {
      let table = self.relation_table(relation_type);
      dump.relations.extend(table.iter().map(|r| (**r).clone()));
      dump.counters.relations.insert(relation_type, table.next_id());
    }
    for table in HierarchyTable::iter() {
      let forest = self.forest(table);
      let mut nodes: Vec<_> = forest.nodes().map(|n| (**n).clone()).collect();
      nodes.sort_by_key(|n| n.seq);
      dump.nodes.extend(nodes);
      dump.counters.nodes.insert(table, forest.next_handle());
    }
    dump
  }

  /// Rebuild an archive from previously committed rows.
  ///
  /// Nothing is replayed through `journal`; the rows are re-verified
  /// instead. A dump that violates any integrity rule (dangling reference,
  /// slot of the wrong kind, duplicate key or seq, cycle) is rejected whole.
  pub fn restore(journal: J, dump: Dump) -> Result<Self> {
    let Dump { entities, relations, nodes, counters } = dump;

    let mut entity_tables: HashMap<EntityKind, EntityTable> = HashMap::new();
    for entity in entities {
      let table = entity_tables.entry(entity.kind).or_default();
      if table.contains(entity.uid) {
        return Err(Error::DuplicateKey(entity.reference().to_string()));
      }
      table.put(Arc::new(entity));
    }
    for (kind, next) in counters.entities {
      entity_tables.entry(kind).or_default().reserve(next);
    }
    let exists = |r: EntityRef| {
      entity_tables
        .get(&r.kind)
        .is_some_and(|t| t.contains(r.uid))
    };

    let mut relation_tables: HashMap<RelationType, RelationTable> = HashMap::new();
    for relation in relations {
      let relation_type = relation.handle.relation_type;
      let table = relation_tables.entry(relation_type).or_default();
      if table.get(relation.handle.id).is_some() {
        return Err(Error::DuplicateKey(relation.handle.to_string()));
      }
      let input = NewRelation {
        relation_type,
        from: relation.from,
        to: relation.to,
        refs: relation.refs.clone(),
        attributes: relation.attributes.clone(),
      };
      integrity::check_relation(&input, exists)?;
      table.insert(Arc::new(relation));
    }
    for (relation_type, next) in counters.relations {
      relation_tables.entry(relation_type).or_default().reserve(next);
    }

    // Sibling order is keyed by seq, so a repeated seq would shadow a node.
    let mut forests: HashMap<HierarchyTable, Forest> = HashMap::new();
    let mut seqs: HashSet<(HierarchyTable, u64)> = HashSet::new();
    for node in nodes {
      let table = node.handle.table;
      let forest = forests.entry(table).or_insert_with(|| Forest::new(table));
      if forest.contains(node.uid) || forest.resolve(node.handle).is_some() {
        return Err(Error::DuplicateKey(format!("{} in {table}", node.uid)));
      }
      if !seqs.insert((table, node.seq)) {
        return Err(Error::DuplicateKey(format!(
          "seq {} of {} in {table}",
          node.seq, node.uid
        )));
      }
      forest.put(Arc::new(node));
    }
    for (table, next) in counters.nodes {
      forests
        .entry(table)
        .or_insert_with(|| Forest::new(table))
        .reserve_handles(next);
    }
    for forest in forests.values() {
      integrity::check_forest(forest, exists)?;
    }

    tracing::debug!(
      entities = entity_tables.values().map(EntityTable::len).sum::<usize>(),
      relations = relation_tables.values().map(RelationTable::len).sum::<usize>(),
      nodes = forests.values().map(Forest::len).sum::<usize>(),
      "archive restored"
    );
    Ok(Self::from_tables(journal, entity_tables, relation_tables, forests))
  }
}
