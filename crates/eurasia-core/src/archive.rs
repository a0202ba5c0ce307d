//! [`Archive`]: the entity, relation and hierarchy stores behind one
//! integrity choke point.
//!
//! Every table keeps its committed state as an `Arc` snapshot of persistent
//! collections. Readers clone the `Arc` and never wait for writers. Writers
//! take the async writer locks of every table their mutation touches (in
//! [`TableId`] order), validate against the committed snapshots, stage an
//! edited copy, journal the change, and finally swap the staged copy in.
//! Each mutation publishes exactly one table, so readers observe either the
//! old state or the new one.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use parking_lot::RwLock;
use strum::IntoEnumIterator;
use tokio::sync::Mutex;

use crate::{
  Error, Result,
  entity::{Attributes, Entity, EntityKind, EntityRef, EntityTable, Uid},
  hierarchy::{Attached, Forest, HierarchyNode, NodeHandle},
  integrity::{self, WriteSet},
  journal::{Change, Journal, NullJournal},
  relation::{Direction, Neighbors, NewRelation, Relation, RelationHandle, RelationTable},
  schema::{HierarchyTable, RelationType, TableId},
  traverse::{self, Descendants},
};

// ─── Partitions ──────────────────────────────────────────────────────────────

struct Partition<T> {
  committed: RwLock<Arc<T>>,
  writer:    Arc<Mutex<()>>,
}

impl<T> Partition<T> {
  fn new(initial: T) -> Self {
    Self {
      committed: RwLock::new(Arc::new(initial)),
      writer:    Arc::new(Mutex::new(())),
    }
  }

  fn snapshot(&self) -> Arc<T> { Arc::clone(&self.committed.read()) }

  fn publish(&self, next: T) { *self.committed.write() = Arc::new(next); }
}

/// A table edited by a mutation, waiting to be published.
enum Staged {
  Entities(EntityKind, EntityTable),
  Relations(RelationType, RelationTable),
  Forest(HierarchyTable, Forest),
}

struct Inner<J> {
  entities:  HashMap<EntityKind, Partition<EntityTable>>,
  relations: HashMap<RelationType, Partition<RelationTable>>,
  forests:   HashMap<HierarchyTable, Partition<Forest>>,
  journal:   J,
}

impl<J: Journal> Inner<J> {
  fn new(
    journal: J,
    mut entities: HashMap<EntityKind, EntityTable>,
    mut relations: HashMap<RelationType, RelationTable>,
    mut forests: HashMap<HierarchyTable, Forest>,
  ) -> Self {
    Self {
      entities: EntityKind::iter()
        .map(|k| (k, Partition::new(entities.remove(&k).unwrap_or_default())))
        .collect(),
      relations: RelationType::iter()
        .map(|t| (t, Partition::new(relations.remove(&t).unwrap_or_default())))
        .collect(),
      forests: HierarchyTable::iter()
        .map(|h| {
          let forest = forests.remove(&h).unwrap_or_else(|| Forest::new(h));
          (h, Partition::new(forest))
        })
        .collect(),
      journal,
    }
  }

  fn entities(&self, kind: EntityKind) -> &Partition<EntityTable> { &self.entities[&kind] }

  fn relations(&self, relation_type: RelationType) -> &Partition<RelationTable> {
    &self.relations[&relation_type]
  }

  fn forest(&self, table: HierarchyTable) -> &Partition<Forest> { &self.forests[&table] }

  fn writer(&self, table: TableId) -> Arc<Mutex<()>> {
    let lock = match table {
      TableId::Entity(kind) => &self.entities(kind).writer,
      TableId::Relation(t) => &self.relations(t).writer,
      TableId::Hierarchy(h) => &self.forest(h).writer,
    };
    Arc::clone(lock)
  }

  /// Take the writer locks of `tables` in their global order.
  async fn lock(&self, tables: impl IntoIterator<Item = TableId>) -> WriteSet {
    let mut guards = Vec::new();
    for table in tables {
      guards.push(self.writer(table).lock_owned().await);
    }
    WriteSet::new(guards)
  }

  fn exists(&self, entity: EntityRef) -> bool {
    self.entities(entity.kind).snapshot().contains(entity.uid)
  }

  fn publish(&self, staged: Staged) {
    match staged {
      Staged::Entities(kind, table) => self.entities(kind).publish(table),
      Staged::Relations(t, table) => self.relations(t).publish(table),
      Staged::Forest(h, forest) => self.forest(h).publish(forest),
    }
  }
}

// ─── Archive ─────────────────────────────────────────────────────────────────

/// The archive engine. Cloning is cheap; clones share all state.
///
/// Mutations must run inside a tokio runtime: once a mutation has passed
/// validation its journal write and publish run on a spawned task, so
/// dropping the caller's future cannot leave a change journaled but
/// unpublished.
pub struct Archive<J = NullJournal> {
  inner: Arc<Inner<J>>,
}

impl<J> Clone for Archive<J> {
  fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl Archive<NullJournal> {
  /// An empty archive that keeps nothing beyond process memory.
  pub fn in_memory() -> Self { Self::new(NullJournal) }
}

impl<J: Journal> Archive<J> {
  /// An empty archive writing through `journal`.
  pub fn new(journal: J) -> Self {
    Self::from_tables(journal, HashMap::new(), HashMap::new(), HashMap::new())
  }

  pub(crate) fn from_tables(
    journal: J,
    entities: HashMap<EntityKind, EntityTable>,
    relations: HashMap<RelationType, RelationTable>,
    forests: HashMap<HierarchyTable, Forest>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner::new(journal, entities, relations, forests)),
    }
  }

  pub fn journal(&self) -> &J { &self.inner.journal }

  /// Journal `change`, then publish `staged`, as one uncancellable step.
  async fn commit(&self, locks: WriteSet, change: Change, staged: Staged) -> Result<()> {
    let inner = Arc::clone(&self.inner);
    let task = tokio::spawn(async move {
      let _locks = locks;
      inner.journal.commit(change).await.map_err(Error::storage)?;
      inner.publish(staged);
      Ok(())
    });
    task.await.map_err(Error::storage)?
  }

  // ── Entity store ────────────────────────────────────────────────────────

  /// Create an entity under the next free UID of its kind.
  pub async fn create(&self, kind: EntityKind, attributes: Attributes) -> Result<Entity> {
    self
      .insert_entity(kind, None, attributes)
      .await
      .inspect_err(|e| tracing::debug!(%kind, error = %e, "create rejected"))
  }

  /// Create an entity under a caller-supplied UID.
  pub async fn create_with_uid(
    &self,
    kind: EntityKind,
    uid: Uid,
    attributes: Attributes,
  ) -> Result<Entity> {
    self
      .insert_entity(kind, Some(uid), attributes)
      .await
      .inspect_err(|e| tracing::debug!(%kind, %uid, error = %e, "create rejected"))
  }

  async fn insert_entity(
    &self,
    kind: EntityKind,
    uid: Option<Uid>,
    attributes: Attributes,
  ) -> Result<Entity> {
    let locks = self.inner.lock(integrity::entity_write_tables(kind)).await;
    let mut table = (*self.inner.entities(kind).snapshot()).clone();

    let uid = match uid {
      Some(uid) => uid,
      None => table.allocate(kind)?,
    };
    if table.contains(uid) {
      return Err(Error::DuplicateKey(kind.at(uid).to_string()));
    }

    let entity = Entity::new(kind, uid, attributes);
    table.put(Arc::new(entity.clone()));
    self
      .commit(
        locks,
        Change::PutEntity { entity: entity.clone() },
        Staged::Entities(kind, table),
      )
      .await?;

    tracing::debug!(entity = %entity.reference(), "entity created");
    Ok(entity)
  }

  pub fn get(&self, kind: EntityKind, uid: Uid) -> Result<Entity> {
    self
      .inner
      .entities(kind)
      .snapshot()
      .get(uid)
      .map(|e| (**e).clone())
      .ok_or_else(|| Error::NotFound(kind.at(uid).to_string()))
  }

  pub fn contains(&self, entity: EntityRef) -> bool { self.inner.exists(entity) }

  /// All entities of `kind` in UID order.
  pub fn list(&self, kind: EntityKind) -> Vec<Entity> {
    self
      .inner
      .entities(kind)
      .snapshot()
      .iter()
      .map(|e| (**e).clone())
      .collect()
  }

  /// Replace an entity's attributes and bump its version.
  pub async fn update(
    &self,
    kind: EntityKind,
    uid: Uid,
    attributes: Attributes,
  ) -> Result<Entity> {
    let locks = self.inner.lock(integrity::entity_write_tables(kind)).await;
    let mut table = (*self.inner.entities(kind).snapshot()).clone();

    let current = table
      .get(uid)
      .ok_or_else(|| Error::NotFound(kind.at(uid).to_string()))?;
    let mut entity = (**current).clone();
    entity.attributes = attributes;
    entity.version += 1;
    entity.updated_at = Utc::now();

    table.put(Arc::new(entity.clone()));
    self
      .commit(
        locks,
        Change::PutEntity { entity: entity.clone() },
        Staged::Entities(kind, table),
      )
      .await?;
    Ok(entity)
  }

  /// Delete an entity. Refused while any relation or hierarchy node still
  /// references it.
  pub async fn delete(&self, kind: EntityKind, uid: Uid) -> Result<()> {
    self
      .delete_entity(kind.at(uid))
      .await
      .inspect_err(|e| tracing::debug!(%kind, %uid, error = %e, "delete rejected"))
  }

  async fn delete_entity(&self, entity: EntityRef) -> Result<()> {
    let kind = entity.kind;
    let locks = self.inner.lock(integrity::entity_delete_tables(kind)).await;
    let mut table = (*self.inner.entities(kind).snapshot()).clone();
    if !table.contains(entity.uid) {
      return Err(Error::NotFound(entity.to_string()));
    }

    let relations: Vec<_> = RelationType::referencing(kind)
      .map(|t| self.inner.relations(t).snapshot())
      .collect();
    let forests: Vec<_> = HierarchyTable::iter()
      .filter(|h| h.member() == kind)
      .map(|h| self.inner.forest(h).snapshot())
      .collect();
    let dependents = integrity::dependents(
      entity,
      relations.iter().map(|t| &**t),
      forests.iter().map(|f| &**f),
    );
    if dependents > 0 {
      return Err(Error::ReferentialIntegrityViolation { entity, dependents });
    }

    table.remove(entity.uid);
    self
      .commit(locks, Change::DeleteEntity { entity }, Staged::Entities(kind, table))
      .await?;

    tracing::debug!(%entity, "entity deleted");
    Ok(())
  }

  // ── Relation store ──────────────────────────────────────────────────────

  /// Store an edge. Submitting an exact duplicate of a live edge returns the
  /// existing handle.
  pub async fn link(&self, input: NewRelation) -> Result<RelationHandle> {
    let relation_type = input.relation_type;
    self
      .insert_relation(input)
      .await
      .inspect_err(|e| tracing::debug!(%relation_type, error = %e, "link rejected"))
  }

  async fn insert_relation(&self, input: NewRelation) -> Result<RelationHandle> {
    let relation_type = input.relation_type;
    let locks = self
      .inner
      .lock(integrity::relation_tables(relation_type))
      .await;
    integrity::check_relation(&input, |r| self.inner.exists(r))?;

    let mut table = (*self.inner.relations(relation_type).snapshot()).clone();
    if let Some(existing) = table.find_duplicate(&input) {
      return Ok(existing.handle);
    }

    let id = table.allocate(relation_type)?;
    let relation = Relation {
      handle:      RelationHandle { relation_type, id },
      from:        input.from,
      to:          input.to,
      refs:        input.refs,
      attributes:  input.attributes,
      recorded_at: Utc::now(),
    };
    let handle = relation.handle;
    table.insert(Arc::new(relation.clone()));
    self
      .commit(
        locks,
        Change::PutRelation { relation },
        Staged::Relations(relation_type, table),
      )
      .await?;

    tracing::debug!(%handle, "relation linked");
    Ok(handle)
  }

  /// Remove an edge. Edges have no dependents, so this never cascades.
  pub async fn unlink(&self, handle: RelationHandle) -> Result<()> {
    let relation_type = handle.relation_type;
    let locks = self
      .inner
      .lock([TableId::Relation(relation_type)])
      .await;
    let mut table = (*self.inner.relations(relation_type).snapshot()).clone();
    if table.remove(handle.id).is_none() {
      return Err(Error::NotFound(handle.to_string()));
    }
    self
      .commit(
        locks,
        Change::DeleteRelation { handle },
        Staged::Relations(relation_type, table),
      )
      .await?;

    tracing::debug!(%handle, "relation unlinked");
    Ok(())
  }

  pub fn relation(&self, handle: RelationHandle) -> Result<Relation> {
    self
      .inner
      .relations(handle.relation_type)
      .snapshot()
      .get(handle.id)
      .map(|r| (**r).clone())
      .ok_or_else(|| Error::NotFound(handle.to_string()))
  }

  /// The live edge `input` would duplicate, if any.
  pub(crate) fn find_relation(&self, input: &NewRelation) -> Option<RelationHandle> {
    self
      .inner
      .relations(input.relation_type)
      .snapshot()
      .find_duplicate(input)
      .map(|r| r.handle)
  }

  /// All edges of one type, in insertion order.
  pub fn edges(&self, relation_type: RelationType) -> Vec<Relation> {
    self
      .inner
      .relations(relation_type)
      .snapshot()
      .iter()
      .map(|r| (**r).clone())
      .collect()
  }

  /// Entities adjacent to `uid` along `relation_type`.
  ///
  /// For [`Direction::Outgoing`] `uid` is read as the relation's `from` kind,
  /// for [`Direction::Incoming`] as its `to` kind.
  pub fn neighbors(
    &self,
    uid: Uid,
    relation_type: RelationType,
    direction: Direction,
  ) -> Neighbors {
    let schema = relation_type.schema();
    let entity = match direction {
      Direction::Outgoing => schema.from.at(uid),
      Direction::Incoming => schema.to.at(uid),
    };
    Neighbors::new(
      self.inner.relations(relation_type).snapshot(),
      relation_type,
      entity,
      direction,
    )
  }

  /// Outgoing neighbors of `uid` along `relation_type`.
  pub fn related(&self, relation_type: RelationType, uid: Uid) -> Neighbors {
    self.neighbors(uid, relation_type, Direction::Outgoing)
  }

  // ── Hierarchy store ─────────────────────────────────────────────────────

  /// Attach `child` under `parent`, or as a root when `parent` is `None`.
  ///
  /// Attaching a node that is already in place returns its handle, and
  /// promoting a root under `parent` moves it there. In both cases the node
  /// keeps the attributes it was first attached with and `attributes` is
  /// ignored.
  pub async fn attach(
    &self,
    table: HierarchyTable,
    parent: Option<Uid>,
    child: Uid,
    attributes: Attributes,
  ) -> Result<NodeHandle> {
    self
      .attach_node(table, parent, child, attributes)
      .await
      .inspect_err(|e| tracing::debug!(%table, %child, error = %e, "attach rejected"))
  }

  async fn attach_node(
    &self,
    table: HierarchyTable,
    parent: Option<Uid>,
    child: Uid,
    attributes: Attributes,
  ) -> Result<NodeHandle> {
    let locks = self.inner.lock(integrity::hierarchy_tables(table)).await;
    let member = table.member().at(child);
    if !self.inner.exists(member) {
      return Err(Error::UnknownEntity(member));
    }

    let mut forest = (*self.inner.forest(table).snapshot()).clone();
    match forest.attach(parent, child, attributes)? {
      Attached::Unchanged(handle) => Ok(handle),
      Attached::Changed(node) => {
        let handle = node.handle;
        self
          .commit(
            locks,
            Change::PutNode { node: (*node).clone() },
            Staged::Forest(table, forest),
          )
          .await?;
        tracing::debug!(%handle, %child, ?parent, "node attached");
        Ok(handle)
      }
    }
  }

  /// Cut a node from its parent. The node keeps its subtree and becomes a
  /// root; detaching a root changes nothing.
  pub async fn detach(&self, handle: NodeHandle) -> Result<()> {
    self
      .move_node(handle, None)
      .await
      .inspect_err(|e| tracing::debug!(%handle, error = %e, "detach rejected"))
  }

  /// Move a node (with its subtree) under `new_parent`, or to the roots.
  /// Observed by readers as a single step.
  pub async fn reparent(
    &self,
    handle: NodeHandle,
    new_parent: Option<Uid>,
  ) -> Result<()> {
    self
      .move_node(handle, new_parent)
      .await
      .inspect_err(|e| tracing::debug!(%handle, error = %e, "reparent rejected"))
  }

  async fn move_node(&self, handle: NodeHandle, parent: Option<Uid>) -> Result<()> {
    let table = handle.table;
    let locks = self.inner.lock(integrity::hierarchy_tables(table)).await;
    let mut forest = (*self.inner.forest(table).snapshot()).clone();
    let uid = forest
      .resolve(handle)
      .ok_or_else(|| Error::NotFound(handle.to_string()))?;
    if forest.parent(uid) == parent {
      return Ok(());
    }

    let node = forest.set_parent(uid, parent)?;
    self
      .commit(
        locks,
        Change::PutNode { node: (*node).clone() },
        Staged::Forest(table, forest),
      )
      .await?;

    tracing::debug!(%handle, ?parent, "node moved");
    Ok(())
  }

  /// Delete a leaf node from a hierarchy table.
  pub async fn remove_node(&self, table: HierarchyTable, uid: Uid) -> Result<()> {
    let locks = self.inner.lock(integrity::hierarchy_tables(table)).await;
    let mut forest = (*self.inner.forest(table).snapshot()).clone();
    forest.remove(uid)?;
    self
      .commit(
        locks,
        Change::DeleteNode { table, uid },
        Staged::Forest(table, forest),
      )
      .await?;

    tracing::debug!(%table, %uid, "node removed");
    Ok(())
  }

  pub fn node(&self, table: HierarchyTable, uid: Uid) -> Result<HierarchyNode> {
    self
      .inner
      .forest(table)
      .snapshot()
      .node(uid)
      .map(|n| (**n).clone())
      .ok_or_else(|| Error::NotFound(format!("{uid} in {table}")))
  }

  pub fn roots(&self, table: HierarchyTable) -> Vec<Uid> {
    self.inner.forest(table).snapshot().roots().collect()
  }

  pub fn children(&self, table: HierarchyTable, uid: Uid) -> Result<Vec<Uid>> {
    let forest = self.inner.forest(table).snapshot();
    if !forest.contains(uid) {
      return Err(Error::NotFound(format!("{uid} in {table}")));
    }
    Ok(forest.children(uid).collect())
  }

  /// A committed snapshot of one hierarchy table.
  pub fn forest(&self, table: HierarchyTable) -> Arc<Forest> {
    self.inner.forest(table).snapshot()
  }

  // ── Traversal ───────────────────────────────────────────────────────────

  /// Ancestors of `uid`, from its parent to the root.
  pub fn ancestors(&self, table: HierarchyTable, uid: Uid) -> Result<Vec<Uid>> {
    traverse::ancestors(&self.inner.forest(table).snapshot(), uid)
  }

  /// Descendants of `uid` in depth-first pre-order.
  pub fn descendants(&self, table: HierarchyTable, uid: Uid) -> Result<Descendants> {
    let forest = self.inner.forest(table).snapshot();
    if !forest.contains(uid) {
      return Err(Error::NotFound(format!("{uid} in {table}")));
    }
    Ok(Descendants::new(forest, uid))
  }

  /// `uid` followed by all of its descendants.
  pub fn subtree(&self, table: HierarchyTable, uid: Uid) -> Result<Vec<Uid>> {
    let mut nodes = vec![uid];
    nodes.extend(self.descendants(table, uid)?.iter());
    Ok(nodes)
  }

  /// Shortest path between two nodes of the same table, both ends included.
  pub fn path(&self, table: HierarchyTable, from: Uid, to: Uid) -> Result<Vec<Uid>> {
    traverse::path(&self.inner.forest(table).snapshot(), from, to)
  }

  /// Number of ancestors of `uid`; zero for roots.
  pub fn depth(&self, table: HierarchyTable, uid: Uid) -> Result<usize> {
    self.ancestors(table, uid).map(|chain| chain.len())
  }

  // ── Snapshots for sibling modules ───────────────────────────────────────

  pub(crate) fn entity_table(&self, kind: EntityKind) -> Arc<EntityTable> {
    self.inner.entities(kind).snapshot()
  }

  pub(crate) fn relation_table(&self, relation_type: RelationType) -> Arc<RelationTable> {
    self.inner.relations(relation_type).snapshot()
  }
}
