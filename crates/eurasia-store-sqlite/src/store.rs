//! [`SqliteJournal`]: the SQLite implementation of [`Journal`].

use std::path::Path;

use eurasia_core::{
  Archive,
  dump::Dump,
  journal::{Change, Journal},
};

use crate::{
  Result,
  encode::{RawEntity, RawNode, RawRelation, RawSequence, decode_id, decode_name, encode_id},
  schema::SCHEMA,
};

/// A change lowered to column values, ready to move onto the database
/// thread.
enum Statement {
  PutEntity(RawEntity),
  DeleteEntity { kind: String, uid: i64 },
  PutRelation(RawRelation),
  DeleteRelation { relation_type: String, id: i64 },
  PutNode(RawNode),
  DeleteNode { hierarchy: String, uid: i64 },
}

impl Statement {
  fn encode(change: &Change) -> Result<Self> {
    Ok(match change {
      Change::PutEntity { entity } => Self::PutEntity(RawEntity::from_entity(entity)?),
      Change::DeleteEntity { entity } => Self::DeleteEntity {
        kind: entity.kind.to_string(),
        uid:  encode_id(entity.uid.0)?,
      },
      Change::PutRelation { relation } => {
        Self::PutRelation(RawRelation::from_relation(relation)?)
      }
      Change::DeleteRelation { handle } => Self::DeleteRelation {
        relation_type: handle.relation_type.to_string(),
        id:            encode_id(handle.id)?,
      },
      Change::PutNode { node } => Self::PutNode(RawNode::from_node(node)?),
      Change::DeleteNode { table, uid } => Self::DeleteNode {
        hierarchy: table.to_string(),
        uid:       encode_id(uid.0)?,
      },
    })
  }
}

/// Raise an allocator high-water mark inside the change's transaction.
fn bump_sequence(
  tx: &rusqlite::Transaction<'_>,
  scope: &str,
  name: &str,
  id: i64,
) -> rusqlite::Result<()> {
  tx.execute(
    "INSERT INTO sequences (scope, name, next) VALUES (?1, ?2, ?3)
     ON CONFLICT (scope, name) DO UPDATE SET next = max(next, excluded.next)",
    rusqlite::params![scope, name, id.saturating_add(1)],
  )?;
  Ok(())
}

// ─── Journal ─────────────────────────────────────────────────────────────────

/// An archive journal backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteJournal {
  conn: tokio_rusqlite::Connection,
}

impl SqliteJournal {
  /// Open (or create) a journal at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let journal = Self { conn };
    journal.init_schema().await?;
    Ok(journal)
  }

  /// Open an in-memory journal, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let journal = Self { conn };
    journal.init_schema().await?;
    Ok(journal)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Read every stored row back.
  pub async fn load(&self) -> Result<Dump> {
    let (entities, relations, nodes, sequences) = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT kind, uid, version, attributes, created_at, updated_at
           FROM entities ORDER BY kind, uid",
        )?;
        let entities = stmt
          .query_map([], |row| {
            Ok(RawEntity {
              kind:       row.get(0)?,
              uid:        row.get(1)?,
              version:    row.get(2)?,
              attributes: row.get(3)?,
              created_at: row.get(4)?,
              updated_at: row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
          "SELECT relation_type, id, from_kind, from_uid, to_kind, to_uid,
                  refs, attributes, recorded_at
           FROM relations ORDER BY relation_type, id",
        )?;
        let relations = stmt
          .query_map([], |row| {
            Ok(RawRelation {
              relation_type: row.get(0)?,
              id:            row.get(1)?,
              from_kind:     row.get(2)?,
              from_uid:      row.get(3)?,
              to_kind:       row.get(4)?,
              to_uid:        row.get(5)?,
              refs:          row.get(6)?,
              attributes:    row.get(7)?,
              recorded_at:   row.get(8)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
          "SELECT hierarchy, uid, handle, parent_uid, seq, attributes, recorded_at
           FROM hierarchy_nodes ORDER BY hierarchy, seq",
        )?;
        let nodes = stmt
          .query_map([], |row| {
            Ok(RawNode {
              hierarchy:   row.get(0)?,
              uid:         row.get(1)?,
              handle:      row.get(2)?,
              parent_uid:  row.get(3)?,
              seq:         row.get(4)?,
              attributes:  row.get(5)?,
              recorded_at: row.get(6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("SELECT scope, name, next FROM sequences")?;
        let sequences = stmt
          .query_map([], |row| {
            Ok(RawSequence {
              scope: row.get(0)?,
              name:  row.get(1)?,
              next:  row.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((entities, relations, nodes, sequences))
      })
      .await?;

    let mut dump = Dump {
      entities:  entities
        .into_iter()
        .map(RawEntity::into_entity)
        .collect::<Result<_>>()?,
      relations: relations
        .into_iter()
        .map(RawRelation::into_relation)
        .collect::<Result<_>>()?,
      nodes:     nodes
        .into_iter()
        .map(RawNode::into_node)
        .collect::<Result<_>>()?,
      counters:  Default::default(),
    };

    for seq in sequences {
      let next = decode_id(seq.next)?;
      match seq.scope.as_str() {
        "entity" => {
          dump
            .counters
            .entities
            .insert(decode_name("entity kind", &seq.name)?, next);
        }
        "relation" => {
          dump
            .counters
            .relations
            .insert(decode_name("relation type", &seq.name)?, next);
        }
        "node" => {
          dump
            .counters
            .nodes
            .insert(decode_name("hierarchy", &seq.name)?, next);
        }
        other => tracing::warn!(scope = other, "ignoring unknown sequence scope"),
      }
    }

    tracing::debug!(
      entities = dump.entities.len(),
      relations = dump.relations.len(),
      nodes = dump.nodes.len(),
      "journal loaded"
    );
    Ok(dump)
  }

  /// Load the stored rows and rebuild a verified archive that keeps
  /// writing through this journal.
  pub async fn into_archive(self) -> Result<Archive<Self>> {
    let dump = self.load().await?;
    Ok(Archive::restore(self, dump)?)
  }

  async fn apply(&self, statement: Statement) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        match statement {
          Statement::PutEntity(row) => {
            tx.execute(
              "INSERT OR REPLACE INTO entities
                 (kind, uid, version, attributes, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
              rusqlite::params![
                row.kind,
                row.uid,
                row.version,
                row.attributes,
                row.created_at,
                row.updated_at,
              ],
            )?;
            bump_sequence(&tx, "entity", &row.kind, row.uid)?;
          }
          Statement::DeleteEntity { kind, uid } => {
            tx.execute(
              "DELETE FROM entities WHERE kind = ?1 AND uid = ?2",
              rusqlite::params![kind, uid],
            )?;
          }
          Statement::PutRelation(row) => {
            tx.execute(
              "INSERT INTO relations (
                 relation_type, id, from_kind, from_uid, to_kind, to_uid,
                 refs, attributes, recorded_at
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
              rusqlite::params![
                row.relation_type,
                row.id,
                row.from_kind,
                row.from_uid,
                row.to_kind,
                row.to_uid,
                row.refs,
                row.attributes,
                row.recorded_at,
              ],
            )?;
            bump_sequence(&tx, "relation", &row.relation_type, row.id)?;
          }
          Statement::DeleteRelation { relation_type, id } => {
            tx.execute(
              "DELETE FROM relations WHERE relation_type = ?1 AND id = ?2",
              rusqlite::params![relation_type, id],
            )?;
          }
          Statement::PutNode(row) => {
            tx.execute(
              "INSERT OR REPLACE INTO hierarchy_nodes
                 (hierarchy, uid, handle, parent_uid, seq, attributes, recorded_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
              rusqlite::params![
                row.hierarchy,
                row.uid,
                row.handle,
                row.parent_uid,
                row.seq,
                row.attributes,
                row.recorded_at,
              ],
            )?;
            bump_sequence(&tx, "node", &row.hierarchy, row.handle)?;
          }
          Statement::DeleteNode { hierarchy, uid } => {
            tx.execute(
              "DELETE FROM hierarchy_nodes WHERE hierarchy = ?1 AND uid = ?2",
              rusqlite::params![hierarchy, uid],
            )?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Journal impl ────────────────────────────────────────────────────────────

impl Journal for SqliteJournal {
  type Error = crate::Error;

  async fn commit(&self, change: Change) -> Result<()> {
    let statement = Statement::encode(&change)?;
    self.apply(statement).await
  }
}
