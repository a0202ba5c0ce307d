//! Encoding and decoding helpers between domain types and the plain values
//! stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings. Attribute maps and relation slot
//! references are compact JSON. Enum names use their snake_case form.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use eurasia_core::{
  entity::{Attributes, Entity, EntityKind, EntityRef, Uid},
  hierarchy::{HierarchyNode, NodeHandle},
  relation::{Refs, Relation, RelationHandle},
  schema::{HierarchyTable, RelationType},
};

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_id(id: u64) -> Result<i64> {
  i64::try_from(id).map_err(|_| Error::Decode(format!("id {id} exceeds i64")))
}

pub fn decode_id(raw: i64) -> Result<u64> {
  u64::try_from(raw).map_err(|_| Error::Decode(format!("negative id {raw}")))
}

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Decode(e.to_string()))
}

/// Parse a snake_case enum name.
pub fn decode_name<T: FromStr>(what: &str, s: &str) -> Result<T> {
  s.parse()
    .map_err(|_| Error::Decode(format!("unknown {what}: {s:?}")))
}

pub fn encode_attributes(attributes: &Attributes) -> Result<String> {
  Ok(serde_json::to_string(attributes)?)
}

pub fn decode_attributes(s: &str) -> Result<Attributes> { Ok(serde_json::from_str(s)?) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column values of an `entities` row.
pub struct RawEntity {
  pub kind:       String,
  pub uid:        i64,
  pub version:    i64,
  pub attributes: String,
  pub created_at: String,
  pub updated_at: String,
}

impl RawEntity {
  pub fn from_entity(entity: &Entity) -> Result<Self> {
    Ok(Self {
      kind:       entity.kind.to_string(),
      uid:        encode_id(entity.uid.0)?,
      version:    encode_id(entity.version)?,
      attributes: encode_attributes(&entity.attributes)?,
      created_at: encode_dt(entity.created_at),
      updated_at: encode_dt(entity.updated_at),
    })
  }

  pub fn into_entity(self) -> Result<Entity> {
    Ok(Entity {
      kind:       decode_name::<EntityKind>("entity kind", &self.kind)?,
      uid:        Uid(decode_id(self.uid)?),
      version:    decode_id(self.version)?,
      attributes: decode_attributes(&self.attributes)?,
      created_at: decode_dt(&self.created_at)?,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}

/// Column values of a `relations` row.
pub struct RawRelation {
  pub relation_type: String,
  pub id:            i64,
  pub from_kind:     String,
  pub from_uid:      i64,
  pub to_kind:       String,
  pub to_uid:        i64,
  pub refs:          String,
  pub attributes:    String,
  pub recorded_at:   String,
}

impl RawRelation {
  pub fn from_relation(relation: &Relation) -> Result<Self> {
    Ok(Self {
      relation_type: relation.handle.relation_type.to_string(),
      id:            encode_id(relation.handle.id)?,
      from_kind:     relation.from.kind.to_string(),
      from_uid:      encode_id(relation.from.uid.0)?,
      to_kind:       relation.to.kind.to_string(),
      to_uid:        encode_id(relation.to.uid.0)?,
      refs:          serde_json::to_string(&relation.refs)?,
      attributes:    encode_attributes(&relation.attributes)?,
      recorded_at:   encode_dt(relation.recorded_at),
    })
  }

  pub fn into_relation(self) -> Result<Relation> {
    let endpoint = |kind: &str, uid: i64| -> Result<EntityRef> {
      Ok(EntityRef {
        kind: decode_name("entity kind", kind)?,
        uid:  Uid(decode_id(uid)?),
      })
    };
    let refs: Refs = serde_json::from_str(&self.refs)?;

    Ok(Relation {
      handle: RelationHandle {
        relation_type: decode_name::<RelationType>("relation type", &self.relation_type)?,
        id:            decode_id(self.id)?,
      },
      from: endpoint(&self.from_kind, self.from_uid)?,
      to: endpoint(&self.to_kind, self.to_uid)?,
      refs,
      attributes: decode_attributes(&self.attributes)?,
      recorded_at: decode_dt(&self.recorded_at)?,
    })
  }
}

/// Column values of a `hierarchy_nodes` row.
pub struct RawNode {
  pub hierarchy:   String,
  pub uid:         i64,
  pub handle:      i64,
  pub parent_uid:  Option<i64>,
  pub seq:         i64,
  pub attributes:  String,
  pub recorded_at: String,
}

impl RawNode {
  pub fn from_node(node: &HierarchyNode) -> Result<Self> {
    Ok(Self {
      hierarchy:   node.handle.table.to_string(),
      uid:         encode_id(node.uid.0)?,
      handle:      encode_id(node.handle.id)?,
      parent_uid:  node.parent.map(|p| encode_id(p.0)).transpose()?,
      seq:         encode_id(node.seq)?,
      attributes:  encode_attributes(&node.attributes)?,
      recorded_at: encode_dt(node.recorded_at),
    })
  }

  pub fn into_node(self) -> Result<HierarchyNode> {
    let table: HierarchyTable = decode_name("hierarchy", &self.hierarchy)?;
    Ok(HierarchyNode {
      handle:      NodeHandle { table, id: decode_id(self.handle)? },
      uid:         Uid(decode_id(self.uid)?),
      parent:      self.parent_uid.map(decode_id).transpose()?.map(Uid),
      seq:         decode_id(self.seq)?,
      attributes:  decode_attributes(&self.attributes)?,
      recorded_at: decode_dt(&self.recorded_at)?,
    })
  }
}

/// One row of the `sequences` table.
pub struct RawSequence {
  pub scope: String,
  pub name:  String,
  pub next:  i64,
}
