//! Traversal over committed hierarchy snapshots.

use std::{collections::HashMap, sync::Arc};

use crate::{Error, Result, entity::Uid, hierarchy::Forest};

/// Ancestors of `uid`, from its parent up to the root.
pub fn ancestors(forest: &Forest, uid: Uid) -> Result<Vec<Uid>> {
  if !forest.contains(uid) {
    return Err(Error::NotFound(format!("{uid} in {}", forest.table())));
  }
  let mut chain = Vec::new();
  let mut cursor = forest.parent(uid);
  while let Some(current) = cursor {
    // A well-formed forest never loops; the bound only stops a corrupt one.
    if chain.len() >= forest.len() {
      break;
    }
    chain.push(current);
    cursor = forest.parent(current);
  }
  Ok(chain)
}

/// Shortest edge path from `from` to `to`, both ends included, through
/// their lowest common ancestor.
pub fn path(forest: &Forest, from: Uid, to: Uid) -> Result<Vec<Uid>> {
  let mut up = vec![from];
  up.extend(ancestors(forest, from)?);
  let mut down = vec![to];
  down.extend(ancestors(forest, to)?);

  let position: HashMap<Uid, usize> =
    up.iter().enumerate().map(|(i, uid)| (*uid, i)).collect();
  let (meet_down, meet_up) = down
    .iter()
    .enumerate()
    .find_map(|(j, uid)| position.get(uid).map(|&i| (j, i)))
    .ok_or(Error::NoPath { table: forest.table(), from, to })?;

  let mut route: Vec<Uid> = up[..=meet_up].to_vec();
  route.extend(down[..meet_down].iter().rev());
  Ok(route)
}

// ─── Descendants ─────────────────────────────────────────────────────────────

/// The descendants of one node in a committed snapshot, in depth-first
/// pre-order. The node itself is not included.
///
/// Restartable: each [`iter`](Self::iter) call starts over on the same
/// snapshot.
#[derive(Debug, Clone)]
pub struct Descendants {
  forest: Arc<Forest>,
  root:   Uid,
}

impl Descendants {
  pub(crate) fn new(forest: Arc<Forest>, root: Uid) -> Self {
    Self { forest, root }
  }

  pub fn root(&self) -> Uid { self.root }

  pub fn iter(&self) -> DescendantsIter<'_> {
    let mut stack: Vec<Uid> = self.forest.children(self.root).collect();
    stack.reverse();
    DescendantsIter { forest: &self.forest, stack }
  }

  pub fn to_vec(&self) -> Vec<Uid> { self.iter().collect() }
}

impl<'a> IntoIterator for &'a Descendants {
  type IntoIter = DescendantsIter<'a>;
  type Item = Uid;

  fn into_iter(self) -> Self::IntoIter { self.iter() }
}

pub struct DescendantsIter<'a> {
  forest: &'a Forest,
  stack:  Vec<Uid>,
}

impl Iterator for DescendantsIter<'_> {
  type Item = Uid;

  fn next(&mut self) -> Option<Uid> {
    let uid = self.stack.pop()?;
    let mark = self.stack.len();
    self.stack.extend(self.forest.children(uid));
    self.stack[mark..].reverse();
    Some(uid)
  }
}
