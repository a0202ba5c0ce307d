//! Hierarchy forests: the self-referential parent/child tables.
//!
//! A [`Forest`] is an arena of nodes keyed by UID. Each node stores an
//! optional parent pointer; children and roots are indexed separately,
//! ordered by the sequence number at which they were attached. The forest
//! invariant (no node is its own ancestor, at most one parent per node) is
//! checked on every structural change by walking the ancestor chain of the
//! prospective parent.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  entity::{Attributes, Uid},
  schema::HierarchyTable,
};

/// Identifies a node's attachment row. Stable across reparenting.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeHandle {
  pub table: HierarchyTable,
  pub id:    u64,
}

impl fmt::Display for NodeHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.table, self.id)
  }
}

/// One row of a hierarchy table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyNode {
  pub handle:      NodeHandle,
  pub uid:         Uid,
  pub parent:      Option<Uid>,
  /// Attach order; siblings and roots are listed by ascending `seq`.
  pub seq:         u64,
  #[serde(default)]
  pub attributes:  Attributes,
  pub recorded_at: DateTime<Utc>,
}

/// What [`Forest::attach`] did.
#[derive(Debug, Clone)]
pub(crate) enum Attached {
  /// The node already sat under the requested parent.
  Unchanged(NodeHandle),
  /// A node was created or moved; this is its new row.
  Changed(Arc<HierarchyNode>),
}

// ─── Forest ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Forest {
  table:       HierarchyTable,
  nodes:       im::HashMap<Uid, Arc<HierarchyNode>>,
  children:    im::HashMap<Uid, im::OrdMap<u64, Uid>>,
  roots:       im::OrdMap<u64, Uid>,
  handles:     im::HashMap<u64, Uid>,
  next_handle: u64,
  next_seq:    u64,
}

impl Forest {
  pub fn new(table: HierarchyTable) -> Self {
    Self {
      table,
      nodes: im::HashMap::new(),
      children: im::HashMap::new(),
      roots: im::OrdMap::new(),
      handles: im::HashMap::new(),
      next_handle: 1,
      next_seq: 1,
    }
  }

  pub fn table(&self) -> HierarchyTable { self.table }

  pub fn len(&self) -> usize { self.nodes.len() }

  pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

  pub fn contains(&self, uid: Uid) -> bool { self.nodes.contains_key(&uid) }

  pub fn node(&self, uid: Uid) -> Option<&Arc<HierarchyNode>> { self.nodes.get(&uid) }

  pub fn parent(&self, uid: Uid) -> Option<Uid> {
    self.nodes.get(&uid).and_then(|n| n.parent)
  }

  /// The node a handle currently designates.
  pub fn resolve(&self, handle: NodeHandle) -> Option<Uid> {
    if handle.table != self.table {
      return None;
    }
    self.handles.get(&handle.id).copied()
  }

  /// Children of `uid` in attach order. Empty for leaves and unknown UIDs.
  pub fn children(&self, uid: Uid) -> impl Iterator<Item = Uid> + '_ {
    self
      .children
      .get(&uid)
      .into_iter()
      .flat_map(|kids| kids.values().copied())
  }

  pub fn child_count(&self, uid: Uid) -> usize {
    self.children.get(&uid).map_or(0, im::OrdMap::len)
  }

  /// Roots in attach order.
  pub fn roots(&self) -> impl Iterator<Item = Uid> + '_ { self.roots.values().copied() }

  /// All nodes, in no particular order.
  pub fn nodes(&self) -> impl Iterator<Item = &Arc<HierarchyNode>> { self.nodes.values() }

  pub fn next_handle(&self) -> u64 { self.next_handle }

  /// Whether `candidate` is `uid` or one of its ancestors.
  pub fn is_self_or_ancestor(&self, candidate: Uid, uid: Uid) -> bool {
    let mut cursor = Some(uid);
    let mut steps = 0;
    while let Some(current) = cursor {
      if current == candidate {
        return true;
      }
      steps += 1;
      if steps > self.nodes.len() {
        break;
      }
      cursor = self.parent(current);
    }
    false
  }

  // ── Mutations ───────────────────────────────────────────────────────────

  /// Attach `child` under `parent`, or as a root when `parent` is `None`.
  ///
  /// The caller has already confirmed `child` names a live member entity.
  /// `attributes` only seed a new node; an existing node keeps its own.
  pub(crate) fn attach(
    &mut self,
    parent: Option<Uid>,
    child: Uid,
    attributes: Attributes,
  ) -> Result<Attached> {
    if let Some(p) = parent {
      self.check_parent(p, child)?;
    }

    let Some(existing) = self.nodes.get(&child).cloned() else {
      let id = self.fresh(self.next_handle, "handles")?;
      let seq = self.fresh(self.next_seq, "sequence numbers")?;
      let node = HierarchyNode {
        handle: NodeHandle { table: self.table, id },
        uid: child,
        parent,
        seq,
        attributes,
        recorded_at: Utc::now(),
      };
      let node = Arc::new(node);
      self.put(Arc::clone(&node));
      return Ok(Attached::Changed(node));
    };

    match (existing.parent, parent) {
      (current, requested) if current == requested => {
        Ok(Attached::Unchanged(existing.handle))
      }
      (None, Some(_)) => self.set_parent(child, parent).map(Attached::Changed),
      _ => Err(Error::DuplicateKey(format!(
        "{child} is already attached in {}; reparent it instead",
        self.table
      ))),
    }
  }

  /// Move `uid` under `parent`, or make it a root. Its subtree moves with
  /// it.
  pub(crate) fn set_parent(
    &mut self,
    uid: Uid,
    parent: Option<Uid>,
  ) -> Result<Arc<HierarchyNode>> {
    let current = self
      .nodes
      .get(&uid)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("{uid} in {}", self.table)))?;
    if let Some(p) = parent {
      self.check_parent(p, uid)?;
    }

    let seq = self.fresh(self.next_seq, "sequence numbers")?;
    let mut moved = (*current).clone();
    moved.parent = parent;
    moved.seq = seq;
    let moved = Arc::new(moved);
    self.put(Arc::clone(&moved));
    Ok(moved)
  }

  /// Delete a leaf node.
  pub(crate) fn remove(&mut self, uid: Uid) -> Result<Arc<HierarchyNode>> {
    let node = self
      .nodes
      .get(&uid)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("{uid} in {}", self.table)))?;
    let kids = self.child_count(uid);
    if kids > 0 {
      return Err(Error::ReferentialIntegrityViolation {
        entity:     self.table.member().at(uid),
        dependents: kids,
      });
    }
    self.unindex(&node);
    self.nodes.remove(&uid);
    self.handles.remove(&node.handle.id);
    Ok(node)
  }

  /// Insert or replace a row, keeping every index consistent.
  pub(crate) fn put(&mut self, node: Arc<HierarchyNode>) {
    if let Some(previous) = self.nodes.get(&node.uid).cloned() {
      self.unindex(&previous);
    }
    match node.parent {
      Some(p) => {
        self.children.entry(p).or_default().insert(node.seq, node.uid);
      }
      None => {
        self.roots.insert(node.seq, node.uid);
      }
    }
    self.handles.insert(node.handle.id, node.uid);
    self.next_handle = self.next_handle.max(node.handle.id.saturating_add(1));
    self.next_seq = self.next_seq.max(node.seq.saturating_add(1));
    self.nodes.insert(node.uid, node);
  }

  pub(crate) fn reserve_handles(&mut self, next: u64) {
    self.next_handle = self.next_handle.max(next);
  }

  fn unindex(&mut self, node: &HierarchyNode) {
    match node.parent {
      Some(p) => {
        if let Some(kids) = self.children.get_mut(&p) {
          kids.remove(&node.seq);
          if kids.is_empty() {
            self.children.remove(&p);
          }
        }
      }
      None => {
        self.roots.remove(&node.seq);
      }
    }
  }

  /// `put` keeps both counters above every stored value, so a counter is
  /// free unless it has saturated at `u64::MAX`.
  fn fresh(&self, counter: u64, what: &str) -> Result<u64> {
    if counter == u64::MAX {
      return Err(Error::Exhausted(format!("{} {what}", self.table)));
    }
    Ok(counter)
  }

  fn check_parent(&self, parent: Uid, child: Uid) -> Result<()> {
    if !self.contains(parent) {
      return Err(Error::UnknownEntity(self.table.member().at(parent)));
    }
    if self.is_self_or_ancestor(child, parent) {
      return Err(Error::CycleDetected { table: self.table, parent, child });
    }
    Ok(())
  }
}
