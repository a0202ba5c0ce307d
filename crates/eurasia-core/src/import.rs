//! Bulk import of records arriving in arbitrary order.
//!
//! Source material rarely comes sorted so that every referenced entity
//! precedes its references. The [`Importer`] parks relations and nodes
//! that fail with [`Error::UnknownEntity`] and retries them whenever an
//! entity or node lands.
//!
//! Records already present in the archive count as unchanged, so running
//! the same file twice is clean. A record that fails for any other reason
//! is reported as rejected; only storage failures and unparseable lines
//! abort the run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
  Archive, Error, Result,
  entity::{Attributes, EntityKind, Uid},
  journal::Journal,
  relation::NewRelation,
  schema::{HierarchyTable, RelationType},
};

/// One line of an import file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ImportRecord {
  Entity {
    kind:       EntityKind,
    #[serde(default)]
    uid:        Option<Uid>,
    #[serde(default)]
    attributes: Attributes,
  },
  /// Endpoint and slot kinds come from the relation catalog.
  Relation {
    relation_type: RelationType,
    from:          Uid,
    to:            Uid,
    #[serde(default)]
    refs:          BTreeMap<String, Uid>,
    #[serde(default)]
    attributes:    Attributes,
  },
  Node {
    table:      HierarchyTable,
    #[serde(default)]
    parent:     Option<Uid>,
    uid:        Uid,
    #[serde(default)]
    attributes: Attributes,
  },
}

impl ImportRecord {
  /// Parse one JSON line.
  pub fn parse_line(line: &str) -> Result<Self> { Ok(serde_json::from_str(line)?) }

  fn into_relation(
    relation_type: RelationType,
    from: Uid,
    to: Uid,
    refs: BTreeMap<String, Uid>,
    attributes: Attributes,
  ) -> Result<NewRelation> {
    let schema = relation_type.schema();
    let mut relation =
      NewRelation::new(relation_type, schema.from.at(from), schema.to.at(to))
        .with_attributes(attributes);
    for (name, uid) in refs {
      let slot = schema.slot(&name).ok_or_else(|| Error::UnexpectedReference {
        relation: relation_type,
        slot:     name.clone(),
      })?;
      relation = relation.with_ref(name, slot.kind.at(uid));
    }
    Ok(relation)
  }
}

/// Outcome of an import run.
#[derive(Debug, Default)]
pub struct ImportReport {
  pub entities:   usize,
  pub relations:  usize,
  pub nodes:      usize,
  /// Records the archive already held exactly as given.
  pub unchanged:  usize,
  /// Records that failed for a reason other than a missing reference.
  pub rejected:   Vec<(ImportRecord, Error)>,
  /// Records still waiting on an entity that never arrived, with the last
  /// error each one produced.
  pub unresolved: Vec<(ImportRecord, Error)>,
}

impl ImportReport {
  pub fn is_clean(&self) -> bool {
    self.rejected.is_empty() && self.unresolved.is_empty()
  }
}

enum Applied {
  Entity,
  Relation,
  Node,
  Unchanged,
}

pub struct Importer<'a, J: Journal> {
  archive: &'a Archive<J>,
  pending: Vec<(ImportRecord, Error)>,
  report:  ImportReport,
}

impl<'a, J: Journal> Importer<'a, J> {
  pub fn new(archive: &'a Archive<J>) -> Self {
    Self { archive, pending: Vec::new(), report: ImportReport::default() }
  }

  /// Number of records currently deferred.
  pub fn pending(&self) -> usize { self.pending.len() }

  /// Apply one record, deferring it if it references something not yet
  /// imported. Records failing for any other reason land in
  /// [`ImportReport::rejected`]; only a storage failure is returned.
  pub async fn submit(&mut self, record: ImportRecord) -> Result<()> {
    match self.apply(record.clone()).await {
      Ok(applied) => {
        let unblocks = self.count(applied);
        if unblocks {
          self.retry_pending().await;
        }
        Ok(())
      }
      Err(err @ Error::UnknownEntity(_)) if !matches!(record, ImportRecord::Entity { .. }) => {
        tracing::trace!(?record, error = %err, "record deferred");
        self.pending.push((record, err));
        Ok(())
      }
      Err(err @ Error::StorageFailure(_)) => Err(err),
      Err(err) => {
        tracing::debug!(?record, error = %err, "record rejected");
        self.report.rejected.push((record, err));
        Ok(())
      }
    }
  }

  /// Parse and submit one JSON line. Blank lines are skipped.
  pub async fn submit_line(&mut self, line: &str) -> Result<()> {
    if line.trim().is_empty() {
      return Ok(());
    }
    self.submit(ImportRecord::parse_line(line)?).await
  }

  pub fn finish(mut self) -> ImportReport {
    self.report.unresolved = std::mem::take(&mut self.pending);
    tracing::info!(
      entities = self.report.entities,
      relations = self.report.relations,
      nodes = self.report.nodes,
      unchanged = self.report.unchanged,
      rejected = self.report.rejected.len(),
      unresolved = self.report.unresolved.len(),
      "import finished"
    );
    self.report
  }

  /// Record a success; returns whether it may unblock deferred records.
  fn count(&mut self, applied: Applied) -> bool {
    match applied {
      Applied::Entity => {
        self.report.entities += 1;
        true
      }
      Applied::Node => {
        self.report.nodes += 1;
        true
      }
      Applied::Relation => {
        self.report.relations += 1;
        false
      }
      Applied::Unchanged => {
        self.report.unchanged += 1;
        false
      }
    }
  }

  /// Retry deferred records until a full pass makes no progress.
  async fn retry_pending(&mut self) {
    loop {
      let mut progressed = false;
      for (record, _) in std::mem::take(&mut self.pending) {
        match self.apply(record.clone()).await {
          Ok(applied) => {
            self.count(applied);
            progressed = true;
          }
          Err(err @ Error::UnknownEntity(_)) => self.pending.push((record, err)),
          Err(err) => {
            tracing::debug!(?record, error = %err, "deferred record rejected");
            self.report.rejected.push((record, err));
          }
        }
      }
      if !progressed || self.pending.is_empty() {
        break;
      }
    }
  }

  async fn apply(&self, record: ImportRecord) -> Result<Applied> {
    match record {
      ImportRecord::Entity { kind, uid: Some(uid), attributes } => {
        if self.archive.get(kind, uid).is_ok_and(|e| e.attributes == attributes) {
          return Ok(Applied::Unchanged);
        }
        self.archive.create_with_uid(kind, uid, attributes).await?;
        Ok(Applied::Entity)
      }
      ImportRecord::Entity { kind, uid: None, attributes } => {
        self.archive.create(kind, attributes).await?;
        Ok(Applied::Entity)
      }
      ImportRecord::Relation { relation_type, from, to, refs, attributes } => {
        let input =
          ImportRecord::into_relation(relation_type, from, to, refs, attributes)?;
        if self.archive.find_relation(&input).is_some() {
          return Ok(Applied::Unchanged);
        }
        self.archive.link(input).await?;
        Ok(Applied::Relation)
      }
      ImportRecord::Node { table, parent, uid, attributes } => {
        if self.archive.node(table, uid).is_ok_and(|n| n.parent == parent) {
          return Ok(Applied::Unchanged);
        }
        self.archive.attach(table, parent, uid, attributes).await?;
        Ok(Applied::Node)
      }
    }
  }
}
