//! Behavioural tests for the archive engine.

use std::{
  io,
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
  time::Duration,
};

use proptest::prelude::*;
use serde_json::json;
use strum::IntoEnumIterator;

use crate::{
  Archive, Error, ErrorClass,
  dump::Dump,
  entity::{Attributes, Entity, EntityKind, Uid},
  hierarchy::NodeHandle,
  import::{ImportRecord, ImportReport, Importer},
  journal::{Change, Journal, NullJournal},
  query::LinkTarget,
  relation::{Direction, NewRelation},
  schema::{CATALOG, HierarchyTable, RelationType},
};

use EntityKind::*;

fn attrs(value: serde_json::Value) -> Attributes {
  match value {
    serde_json::Value::Object(map) => map,
    other => panic!("expected an object, got {other}"),
  }
}

async fn make(archive: &Archive, kind: EntityKind) -> Uid {
  archive.create(kind, Attributes::new()).await.unwrap().uid
}

/// Root -> A -> B -> C in `location_hierarchies`.
struct Chain {
  root:    Uid,
  a:       Uid,
  b:       Uid,
  c:       Uid,
  handles: [NodeHandle; 4],
}

async fn chain(archive: &Archive) -> Chain {
  let t = HierarchyTable::LocationHierarchies;
  let root = make(archive, Location).await;
  let a = make(archive, Location).await;
  let b = make(archive, Location).await;
  let c = make(archive, Location).await;
  let handles = [
    archive.attach(t, None, root, Attributes::new()).await.unwrap(),
    archive.attach(t, Some(root), a, Attributes::new()).await.unwrap(),
    archive.attach(t, Some(a), b, Attributes::new()).await.unwrap(),
    archive.attach(t, Some(b), c, Attributes::new()).await.unwrap(),
  ];
  Chain { root, a, b, c, handles }
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

#[test]
fn catalog_is_indexed_by_relation_type() {
  for (i, relation_type) in RelationType::iter().enumerate() {
    assert_eq!(CATALOG[i].relation_type, relation_type);
  }
}

#[test]
fn classical_genre_requires_knowledge_form() {
  let schema = RelationType::ClassicalGenre.schema();
  let slot = schema.slot("knowledge_form").unwrap();
  assert!(slot.mandatory);
  assert_eq!(slot.kind, KnowledgeForm);
  assert!(schema.references(KnowledgeForm));
}

#[test]
fn error_classes() {
  assert_eq!(Error::NotFound("x".into()).class(), ErrorClass::MissingInput);
  assert_eq!(
    Error::UnknownEntity(Source.at(Uid(1))).class(),
    ErrorClass::MissingInput
  );
  assert_eq!(Error::DuplicateKey("x".into()).class(), ErrorClass::Conflict);
  assert_eq!(
    Error::CycleDetected {
      table:  HierarchyTable::KnowledgeBranch,
      parent: Uid(1),
      child:  Uid(2),
    }
    .class(),
    ErrorClass::Corruption
  );
}

// ─── Entities ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_then_get() {
  let archive = Archive::in_memory();
  let created = archive
    .create(Individual, attrs(json!({ "name": "Rashid al-Din" })))
    .await
    .unwrap();
  assert_eq!(created.uid, Uid(1));
  assert_eq!(created.version, 1);

  let fetched = archive.get(Individual, created.uid).unwrap();
  assert_eq!(fetched, created);
  assert_eq!(fetched.text("name"), Some("Rashid al-Din"));
}

#[tokio::test]
async fn update_bumps_version() {
  let archive = Archive::in_memory();
  let uid = make(&archive, Power).await;
  let updated = archive
    .update(Power, uid, attrs(json!({ "name": "Ilkhanate" })))
    .await
    .unwrap();
  assert_eq!(updated.version, 2);
  assert_eq!(archive.get(Power, uid).unwrap().text("name"), Some("Ilkhanate"));

  let err = archive.update(Power, Uid(99), Attributes::new()).await.unwrap_err();
  assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn uids_are_never_reissued() {
  let archive = Archive::in_memory();
  make(&archive, Epoch).await;
  let second = make(&archive, Epoch).await;
  archive.delete(Epoch, second).await.unwrap();
  assert_eq!(make(&archive, Epoch).await, Uid(3));

  archive
    .create_with_uid(Epoch, Uid(10), Attributes::new())
    .await
    .unwrap();
  assert_eq!(make(&archive, Epoch).await, Uid(11));

  let err = archive
    .create_with_uid(Epoch, Uid(10), Attributes::new())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::DuplicateKey(_)));
}

#[tokio::test]
async fn kinds_have_separate_uid_spaces() {
  let archive = Archive::in_memory();
  assert_eq!(make(&archive, Source).await, Uid(1));
  assert_eq!(make(&archive, Individual).await, Uid(1));
  assert!(archive.contains(Source.at(Uid(1))));
  assert!(!archive.contains(Repository.at(Uid(1))));
}

#[tokio::test]
async fn delete_missing_is_not_found() {
  let archive = Archive::in_memory();
  let err = archive.delete(Honorific, Uid(4)).await.unwrap_err();
  assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn exhausted_uid_space_is_refused() {
  let archive = Archive::in_memory();
  let last = archive
    .create_with_uid(Source, Uid(u64::MAX), attrs(json!({ "title": "Zafarnama" })))
    .await
    .unwrap();

  let err = archive.create(Source, Attributes::new()).await.unwrap_err();
  assert!(matches!(err, Error::Exhausted(_)));
  assert_eq!(err.class(), ErrorClass::Conflict);
  assert_eq!(archive.list(Source), vec![last]);

  let below = archive
    .create_with_uid(Source, Uid(5), Attributes::new())
    .await
    .unwrap();
  assert_eq!(archive.list(Source).len(), 2);
  let kept = archive.get(Source, Uid(u64::MAX)).unwrap();
  assert_eq!(kept.text("title"), Some("Zafarnama"));
  assert_eq!(below.uid, Uid(5));
}

// ─── Relations ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn source_references_individual() {
  let archive = Archive::in_memory();
  let i1 = make(&archive, Individual).await;
  let s1 = make(&archive, Source).await;

  let handle = archive
    .link(NewRelation::new(
      RelationType::ReferencesToIndividuals,
      Source.at(s1),
      Individual.at(i1),
    ))
    .await
    .unwrap();

  let referencing = archive.neighbors(
    i1,
    RelationType::ReferencesToIndividuals,
    Direction::Incoming,
  );
  assert_eq!(referencing.kind(), Source);
  assert_eq!(referencing.to_vec(), vec![s1]);
  assert_eq!(
    archive
      .related(RelationType::ReferencesToIndividuals, s1)
      .to_vec(),
    vec![i1]
  );

  let err = archive.delete(Individual, i1).await.unwrap_err();
  assert!(matches!(
    err,
    Error::ReferentialIntegrityViolation { dependents: 1, .. }
  ));
  assert!(archive.get(Individual, i1).is_ok());

  archive.unlink(handle).await.unwrap();
  archive.delete(Individual, i1).await.unwrap();
  assert!(archive.relation(handle).is_err());
}

#[tokio::test]
async fn duplicate_link_returns_existing_handle() {
  let archive = Archive::in_memory();
  let a = make(&archive, Source).await;
  let b = make(&archive, Source).await;
  let edge = NewRelation::new(RelationType::RelatedSources, Source.at(a), Source.at(b));

  let first = archive.link(edge.clone()).await.unwrap();
  let second = archive.link(edge).await.unwrap();
  assert_eq!(first, second);
  assert_eq!(archive.edges(RelationType::RelatedSources).len(), 1);
}

#[tokio::test]
async fn link_checks_endpoint_kinds() {
  let archive = Archive::in_memory();
  let i = make(&archive, Individual).await;
  let err = archive
    .link(NewRelation::new(
      RelationType::ReferencesToIndividuals,
      Individual.at(i),
      Individual.at(i),
    ))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    Error::KindMismatch { slot: "from", expected: Source, .. }
  ));
  assert_eq!(err.class(), ErrorClass::Input);
}

#[tokio::test]
async fn classical_genre_with_missing_knowledge_form_creates_no_edge() {
  let archive = Archive::in_memory();
  let source = make(&archive, Source).await;
  let classical = make(&archive, ClassicalSource).await;
  let edge = NewRelation::new(
    RelationType::ClassicalGenre,
    Source.at(source),
    ClassicalSource.at(classical),
  );

  let err = archive.link(edge.clone()).await.unwrap_err();
  assert!(matches!(
    err,
    Error::MissingReference { slot: "knowledge_form", .. }
  ));

  let err = archive
    .link(edge.clone().with_ref("knowledge_form", KnowledgeForm.at(Uid(42))))
    .await
    .unwrap_err();
  match err {
    Error::UnknownEntity(missing) => assert_eq!(missing, KnowledgeForm.at(Uid(42))),
    other => panic!("unexpected error: {other}"),
  }
  assert!(archive.edges(RelationType::ClassicalGenre).is_empty());

  let form = make(&archive, KnowledgeForm).await;
  let err = archive
    .link(
      NewRelation::new(
        RelationType::ClassicalGenre,
        Source.at(source),
        ClassicalSource.at(Uid(77)),
      )
      .with_ref("knowledge_form", KnowledgeForm.at(form)),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, Error::UnknownEntity(r) if r == ClassicalSource.at(Uid(77))));
  assert!(archive.edges(RelationType::ClassicalGenre).is_empty());

  archive
    .link(edge.with_ref("knowledge_form", KnowledgeForm.at(form)))
    .await
    .unwrap();
  assert_eq!(archive.edges(RelationType::ClassicalGenre).len(), 1);

  let err = archive.delete(KnowledgeForm, form).await.unwrap_err();
  assert_eq!(err.class(), ErrorClass::Orphaning);
}

#[tokio::test]
async fn optional_slots_may_be_omitted() {
  let archive = Archive::in_memory();
  let person = make(&archive, Individual).await;
  let role = make(&archive, SocialRole).await;
  let source = make(&archive, Source).await;

  archive
    .link(NewRelation::new(
      RelationType::IndividualSocialRoles,
      Individual.at(person),
      SocialRole.at(role),
    ))
    .await
    .unwrap();
  archive
    .link(
      NewRelation::new(
        RelationType::IndividualSocialRoles,
        Individual.at(person),
        SocialRole.at(role),
      )
      .with_ref("source", Source.at(source)),
    )
    .await
    .unwrap();
  assert_eq!(archive.edges(RelationType::IndividualSocialRoles).len(), 2);
}

#[tokio::test]
async fn undeclared_slot_is_rejected() {
  let archive = Archive::in_memory();
  let a = make(&archive, Location).await;
  let b = make(&archive, Location).await;
  let err = archive
    .link(
      NewRelation::new(RelationType::LocationTertiary, Location.at(a), Location.at(b))
        .with_ref("epoch", Epoch.at(Uid(1))),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, Error::UnexpectedReference { .. }));
}

#[tokio::test]
async fn neighbors_is_a_stable_snapshot() {
  let archive = Archive::in_memory();
  let term = make(&archive, LexiconTerm).await;
  let first = make(&archive, Bibliography).await;
  let second = make(&archive, Bibliography).await;
  archive
    .link(NewRelation::new(
      RelationType::Definitions,
      LexiconTerm.at(term),
      Bibliography.at(first),
    ))
    .await
    .unwrap();

  let view = archive.neighbors(term, RelationType::Definitions, Direction::Outgoing);
  archive
    .link(NewRelation::new(
      RelationType::Definitions,
      LexiconTerm.at(term),
      Bibliography.at(second),
    ))
    .await
    .unwrap();

  assert_eq!(view.to_vec(), vec![first]);
  assert_eq!(view.to_vec(), vec![first]);
  assert_eq!(
    archive
      .neighbors(term, RelationType::Definitions, Direction::Outgoing)
      .to_vec(),
    vec![first, second]
  );
}

// ─── Hierarchies ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn descendants_in_pre_order_and_cycle_rejected() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::LocationHierarchies;
  let Chain { root, a, b, c, .. } = chain(&archive).await;

  let below = archive.descendants(t, root).unwrap();
  assert_eq!(below.to_vec(), vec![a, b, c]);
  assert_eq!(archive.ancestors(t, c).unwrap(), vec![b, a, root]);
  assert_eq!(archive.depth(t, root).unwrap(), 0);
  assert_eq!(archive.depth(t, c).unwrap(), 3);

  let err = archive
    .attach(t, Some(c), root, Attributes::new())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::CycleDetected { .. }));
  assert_eq!(archive.roots(t), vec![root]);
  assert_eq!(archive.descendants(t, root).unwrap().to_vec(), vec![a, b, c]);
}

#[tokio::test]
async fn siblings_follow_attach_order() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::KnowledgeBranch;
  let root = make(&archive, KnowledgeForm).await;
  let first = make(&archive, KnowledgeForm).await;
  let second = make(&archive, KnowledgeForm).await;
  let grandchild = make(&archive, KnowledgeForm).await;
  archive.attach(t, None, root, Attributes::new()).await.unwrap();
  archive.attach(t, Some(root), first, Attributes::new()).await.unwrap();
  archive.attach(t, Some(root), second, Attributes::new()).await.unwrap();
  archive.attach(t, Some(first), grandchild, Attributes::new()).await.unwrap();

  assert_eq!(archive.children(t, root).unwrap(), vec![first, second]);
  assert_eq!(
    archive.descendants(t, root).unwrap().to_vec(),
    vec![first, grandchild, second]
  );
  assert_eq!(
    archive.subtree(t, first).unwrap(),
    vec![first, grandchild]
  );
}

#[tokio::test]
async fn attach_is_idempotent_and_rejects_second_parent() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::LocationHierarchies;
  let Chain { root, a, b, handles, .. } = chain(&archive).await;

  let again = archive.attach(t, Some(a), b, Attributes::new()).await.unwrap();
  assert_eq!(again, handles[2]);

  let err = archive
    .attach(t, Some(root), b, Attributes::new())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::DuplicateKey(_)));
  assert_eq!(archive.ancestors(t, b).unwrap(), vec![a, root]);
}

#[tokio::test]
async fn attach_keeps_attributes_of_existing_node() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::LocationHierarchies;
  let root = make(&archive, Location).await;
  let city = make(&archive, Location).await;
  archive
    .attach(t, None, root, attrs(json!({ "rank": "province" })))
    .await
    .unwrap();
  archive
    .attach(t, None, city, attrs(json!({ "rank": "city" })))
    .await
    .unwrap();

  archive
    .attach(t, None, root, attrs(json!({ "rank": "empire" })))
    .await
    .unwrap();
  let node = archive.node(t, root).unwrap();
  assert_eq!(node.attributes, attrs(json!({ "rank": "province" })));

  archive
    .attach(t, Some(root), city, attrs(json!({ "rank": "town" })))
    .await
    .unwrap();
  let node = archive.node(t, city).unwrap();
  assert_eq!(node.parent, Some(root));
  assert_eq!(node.attributes, attrs(json!({ "rank": "city" })));
}

#[tokio::test]
async fn attach_requires_member_and_parent() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::RelatedTerms;
  let err = archive.attach(t, None, Uid(7), Attributes::new()).await.unwrap_err();
  assert!(matches!(err, Error::UnknownEntity(r) if r == LexiconTerm.at(Uid(7))));

  let term = make(&archive, LexiconTerm).await;
  let other = make(&archive, LexiconTerm).await;
  let err = archive
    .attach(t, Some(other), term, Attributes::new())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::UnknownEntity(_)));
  assert!(archive.forest(t).is_empty());
}

#[tokio::test]
async fn detach_makes_a_root_with_its_subtree() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::LocationHierarchies;
  let Chain { root, a, b, c, handles } = chain(&archive).await;

  archive.detach(handles[1]).await.unwrap();
  assert_eq!(archive.roots(t), vec![root, a]);
  assert_eq!(archive.ancestors(t, c).unwrap(), vec![b, a]);
  assert!(archive.descendants(t, root).unwrap().to_vec().is_empty());

  archive.detach(handles[0]).await.unwrap();
  assert_eq!(archive.roots(t), vec![root, a]);

  let bogus = NodeHandle { table: t, id: 999 };
  assert!(matches!(archive.detach(bogus).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn reparent_moves_subtree() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::LocationHierarchies;
  let Chain { root, a, b, c, handles } = chain(&archive).await;
  let d = make(&archive, Location).await;
  archive.attach(t, Some(root), d, Attributes::new()).await.unwrap();

  archive.reparent(handles[2], Some(d)).await.unwrap();
  assert_eq!(archive.ancestors(t, c).unwrap(), vec![b, d, root]);
  assert!(archive.children(t, a).unwrap().is_empty());

  let err = archive.reparent(handles[0], Some(c)).await.unwrap_err();
  assert!(matches!(err, Error::CycleDetected { .. }));
  assert_eq!(archive.node(t, root).unwrap().parent, None);
}

#[tokio::test]
async fn path_through_common_ancestor() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::LocationHierarchies;
  let Chain { root, a, b, c, .. } = chain(&archive).await;
  let d = make(&archive, Location).await;
  archive.attach(t, Some(root), d, Attributes::new()).await.unwrap();

  assert_eq!(archive.path(t, c, d).unwrap(), vec![c, b, a, root, d]);
  assert_eq!(archive.path(t, a, c).unwrap(), vec![a, b, c]);
  assert_eq!(archive.path(t, b, b).unwrap(), vec![b]);

  let island = make(&archive, Location).await;
  archive.attach(t, None, island, Attributes::new()).await.unwrap();
  assert!(matches!(archive.path(t, c, island), Err(Error::NoPath { .. })));
}

#[tokio::test]
async fn removing_nodes_and_members() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::LocationHierarchies;
  let Chain { b, c, .. } = chain(&archive).await;

  let err = archive.remove_node(t, b).await.unwrap_err();
  assert!(matches!(
    err,
    Error::ReferentialIntegrityViolation { dependents: 1, .. }
  ));

  let err = archive.delete(Location, c).await.unwrap_err();
  assert!(matches!(err, Error::ReferentialIntegrityViolation { .. }));

  archive.remove_node(t, c).await.unwrap();
  archive.delete(Location, c).await.unwrap();
  assert!(archive.children(t, b).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_a_half_moved_node() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::LocationHierarchies;
  let root = make(&archive, Location).await;
  let left = make(&archive, Location).await;
  let right = make(&archive, Location).await;
  let moving = make(&archive, Location).await;
  let leaf = make(&archive, Location).await;
  archive.attach(t, None, root, Attributes::new()).await.unwrap();
  archive.attach(t, Some(root), left, Attributes::new()).await.unwrap();
  archive.attach(t, Some(root), right, Attributes::new()).await.unwrap();
  let handle = archive.attach(t, Some(left), moving, Attributes::new()).await.unwrap();
  archive.attach(t, Some(moving), leaf, Attributes::new()).await.unwrap();

  let writer = {
    let archive = archive.clone();
    tokio::spawn(async move {
      for i in 0..200 {
        let target = if i % 2 == 0 { right } else { left };
        archive.reparent(handle, Some(target)).await.unwrap();
      }
    })
  };

  let readers: Vec<_> = (0..4)
    .map(|_| {
      let archive = archive.clone();
      tokio::spawn(async move {
        for _ in 0..500 {
          let chain = archive.ancestors(t, leaf).unwrap();
          assert!(
            chain == vec![moving, left, root] || chain == vec![moving, right, root],
            "torn ancestry: {chain:?}"
          );
          let under_root = archive.descendants(t, root).unwrap().to_vec();
          assert_eq!(under_root.len(), 4);
          tokio::task::yield_now().await;
        }
      })
    })
    .collect();

  writer.await.unwrap();
  for reader in readers {
    reader.await.unwrap();
  }
}

// ─── Journal ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FailingJournal {
  failing: AtomicBool,
}

impl Journal for FailingJournal {
  type Error = io::Error;

  async fn commit(&self, _change: Change) -> Result<(), io::Error> {
    if self.failing.load(Ordering::SeqCst) {
      Err(io::Error::other("disk full"))
    } else {
      Ok(())
    }
  }
}

#[tokio::test]
async fn journal_failure_leaves_state_untouched() {
  let archive = Archive::new(FailingJournal::default());
  let location = archive.create(Location, Attributes::new()).await.unwrap().uid;
  archive
    .attach(HierarchyTable::LocationHierarchies, None, location, Attributes::new())
    .await
    .unwrap();

  archive.journal().failing.store(true, Ordering::SeqCst);

  let err = archive.create(Location, Attributes::new()).await.unwrap_err();
  assert_eq!(err.class(), ErrorClass::Storage);
  assert_eq!(archive.list(Location).len(), 1);

  let err = archive
    .remove_node(HierarchyTable::LocationHierarchies, location)
    .await
    .unwrap_err();
  assert!(matches!(err, Error::StorageFailure(_)));
  assert!(archive.node(HierarchyTable::LocationHierarchies, location).is_ok());

  archive.journal().failing.store(false, Ordering::SeqCst);
  let next = archive.create(Location, Attributes::new()).await.unwrap();
  assert_eq!(next.uid, Uid(2));
}

#[tokio::test]
async fn reparent_rolls_back_on_journal_failure() {
  let archive = Archive::new(FailingJournal::default());
  let t = HierarchyTable::LocationHierarchies;
  let mut uids = Vec::new();
  for _ in 0..3 {
    uids.push(archive.create(Location, Attributes::new()).await.unwrap().uid);
  }
  let [root, other, leaf] = uids[..] else { unreachable!() };
  archive.attach(t, None, root, Attributes::new()).await.unwrap();
  archive.attach(t, None, other, Attributes::new()).await.unwrap();
  let handle = archive.attach(t, Some(root), leaf, Attributes::new()).await.unwrap();

  archive.journal().failing.store(true, Ordering::SeqCst);

  let err = archive.reparent(handle, Some(other)).await.unwrap_err();
  assert!(matches!(err, Error::StorageFailure(_)));
  assert_eq!(archive.ancestors(t, leaf).unwrap(), vec![root]);
  assert!(archive.children(t, other).unwrap().is_empty());

  let err = archive.detach(handle).await.unwrap_err();
  assert_eq!(err.class(), ErrorClass::Storage);
  assert_eq!(archive.roots(t), vec![root, other]);

  archive.journal().failing.store(false, Ordering::SeqCst);
  archive.reparent(handle, Some(other)).await.unwrap();
  assert_eq!(archive.ancestors(t, leaf).unwrap(), vec![other]);
}

/// Holds every commit for `delay` and counts the ones that complete.
struct SlowJournal {
  delay:   Duration,
  commits: AtomicUsize,
}

impl Journal for SlowJournal {
  type Error = io::Error;

  async fn commit(&self, _change: Change) -> Result<(), io::Error> {
    tokio::time::sleep(self.delay).await;
    self.commits.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

#[tokio::test]
async fn dropped_mutations_are_all_or_nothing() {
  let delay = Duration::from_millis(40);
  let archive = Archive::new(SlowJournal { delay, commits: AtomicUsize::new(0) });
  let t = HierarchyTable::LocationHierarchies;
  let source = archive.create(Source, Attributes::new()).await.unwrap().uid;
  let person = archive.create(Individual, Attributes::new()).await.unwrap().uid;
  let mut uids = Vec::new();
  for _ in 0..3 {
    uids.push(archive.create(Location, Attributes::new()).await.unwrap().uid);
  }
  let [root, other, leaf] = uids[..] else { unreachable!() };
  archive.attach(t, None, root, Attributes::new()).await.unwrap();
  archive.attach(t, None, other, Attributes::new()).await.unwrap();
  let handle = archive.attach(t, Some(root), leaf, Attributes::new()).await.unwrap();
  let before = archive.journal().commits.load(Ordering::SeqCst);

  let edge = || {
    NewRelation::new(
      RelationType::ReferencesToIndividuals,
      Source.at(source),
      Individual.at(person),
    )
  };
  let cut = Duration::from_millis(5);
  assert!(tokio::time::timeout(cut, archive.link(edge())).await.is_err());
  assert!(tokio::time::timeout(cut, archive.reparent(handle, Some(other))).await.is_err());

  tokio::time::sleep(delay * 4).await;

  let edges = archive.edges(RelationType::ReferencesToIndividuals);
  assert!(edges.len() <= 1);
  let linked = archive
    .related(RelationType::ReferencesToIndividuals, source)
    .to_vec();
  assert_eq!(linked, edges.iter().map(|r| r.to.uid).collect::<Vec<_>>());

  let ancestors = archive.ancestors(t, leaf).unwrap();
  assert!(ancestors == vec![root] || ancestors == vec![other]);
  let moved = usize::from(ancestors == vec![other]);

  // Everything journaled was published, and nothing else.
  let journaled = archive.journal().commits.load(Ordering::SeqCst) - before;
  assert_eq!(journaled, edges.len() + moved);

  let again = archive.link(edge()).await.unwrap();
  assert_eq!(archive.edges(RelationType::ReferencesToIndividuals).len(), 1);
  if let Some(first) = edges.first() {
    assert_eq!(again, first.handle);
  }
}

// ─── Import ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn importer_resolves_out_of_order_records() {
  let archive = Archive::in_memory();
  let lines = [
    r#"{"record":"relation","relation_type":"copies_holdings","from":1,"to":1,"refs":{"bibliography":3}}"#,
    r#"{"record":"node","table":"location_hierarchies","parent":1,"uid":2}"#,
    r#"{"record":"entity","kind":"source","uid":1,"attributes":{"title":"Jami al-tawarikh"}}"#,
    r#"{"record":"entity","kind":"location","uid":2}"#,
    r#"{"record":"entity","kind":"repository","uid":1}"#,
    r#"{"record":"entity","kind":"location","uid":1}"#,
    r#"{"record":"node","table":"location_hierarchies","uid":1}"#,
    r#"{"record":"relation","relation_type":"seals","from":5,"to":1}"#,
    "",
    r#"{"record":"entity","kind":"bibliography","uid":3}"#,
  ];

  let mut importer = Importer::new(&archive);
  for line in lines {
    importer.submit_line(line).await.unwrap();
  }
  let report = importer.finish();

  assert_eq!(report.entities, 5);
  assert_eq!(report.relations, 1);
  assert_eq!(report.nodes, 2);
  assert!(report.rejected.is_empty());
  assert_eq!(report.unresolved.len(), 1);
  assert!(matches!(
    &report.unresolved[0],
    (ImportRecord::Relation { relation_type: RelationType::Seals, .. }, Error::UnknownEntity(_))
  ));

  let t = HierarchyTable::LocationHierarchies;
  assert_eq!(archive.ancestors(t, Uid(2)).unwrap(), vec![Uid(1)]);
  let holding = &archive.edges(RelationType::CopiesHoldings)[0];
  assert_eq!(holding.refs["bibliography"], Bibliography.at(Uid(3)));
}

#[tokio::test]
async fn importer_rejects_bad_records_and_carries_on() {
  let archive = Archive::in_memory();
  let mut importer = Importer::new(&archive);
  let err = importer.submit_line("{not json").await.unwrap_err();
  assert!(matches!(err, Error::Serialization(_)));

  let lines = [
    r#"{"record":"entity","kind":"source","uid":1,"attributes":{"title":"Shahnama"}}"#,
    r#"{"record":"relation","relation_type":"related_sources","from":1,"to":1,"refs":{"epoch":1}}"#,
    r#"{"record":"entity","kind":"source","uid":1,"attributes":{"title":"Garshaspnama"}}"#,
    r#"{"record":"entity","kind":"source","uid":2}"#,
  ];
  for line in lines {
    importer.submit_line(line).await.unwrap();
  }
  assert_eq!(importer.pending(), 0);
  let report = importer.finish();

  assert_eq!(report.entities, 2);
  assert_eq!(report.unchanged, 0);
  assert!(matches!(
    &report.rejected[..],
    [(_, Error::UnexpectedReference { .. }), (_, Error::DuplicateKey(_))]
  ));
  assert_eq!(archive.get(Source, Uid(1)).unwrap().text("title"), Some("Shahnama"));
}

#[tokio::test]
async fn importing_the_same_records_twice_is_clean() {
  let archive = Archive::in_memory();
  let lines = [
    r#"{"record":"relation","relation_type":"references_to_individuals","from":1,"to":1}"#,
    r#"{"record":"entity","kind":"source","uid":1,"attributes":{"title":"Tarikh-i jahangusha"}}"#,
    r#"{"record":"entity","kind":"individual","uid":1,"attributes":{"name":"Juvaini"}}"#,
    r#"{"record":"entity","kind":"location","uid":1}"#,
    r#"{"record":"node","table":"location_hierarchies","uid":1}"#,
  ];

  let mut reports: Vec<ImportReport> = Vec::new();
  for _ in 0..2 {
    let mut importer = Importer::new(&archive);
    for line in lines {
      importer.submit_line(line).await.unwrap();
    }
    reports.push(importer.finish());
  }

  let [first, second] = &reports[..] else { unreachable!() };
  assert!(first.is_clean());
  assert_eq!((first.entities, first.relations, first.nodes), (3, 1, 1));
  assert_eq!(first.unchanged, 0);

  assert!(second.is_clean());
  assert_eq!((second.entities, second.relations, second.nodes), (0, 0, 0));
  assert_eq!(second.unchanged, 5);
  assert_eq!(archive.edges(RelationType::ReferencesToIndividuals).len(), 1);
  assert_eq!(archive.list(Source).len(), 1);
}

#[tokio::test]
async fn importer_stops_on_storage_failure() {
  let archive = Archive::new(FailingJournal::default());
  archive.journal().failing.store(true, Ordering::SeqCst);
  let mut importer = Importer::new(&archive);
  let err = importer
    .submit_line(r#"{"record":"entity","kind":"epoch","uid":1}"#)
    .await
    .unwrap_err();
  assert!(matches!(err, Error::StorageFailure(_)));
  assert!(archive.list(Epoch).is_empty());
}

// ─── Dump and restore ────────────────────────────────────────────────────────

#[tokio::test]
async fn restore_round_trips_and_keeps_counters() {
  let archive = Archive::in_memory();
  let Chain { root, c, .. } = chain(&archive).await;
  let source = make(&archive, Source).await;
  archive
    .link(NewRelation::new(
      RelationType::ReferencesToLocations,
      Source.at(source),
      Location.at(c),
    ))
    .await
    .unwrap();
  let doomed = make(&archive, Source).await;
  archive.delete(Source, doomed).await.unwrap();

  let dump = archive.dump();
  let restored = Archive::restore(NullJournal, dump).unwrap();

  let t = HierarchyTable::LocationHierarchies;
  assert_eq!(restored.list(Location), archive.list(Location));
  assert_eq!(restored.descendants(t, root).unwrap().to_vec().len(), 3);
  assert_eq!(
    restored.related(RelationType::ReferencesToLocations, source).to_vec(),
    vec![c]
  );
  assert_eq!(make(&restored, Source).await, Uid(3));
}

#[tokio::test]
async fn restore_rejects_dangling_rows() {
  let archive = Archive::in_memory();
  let s = make(&archive, Source).await;
  let i = make(&archive, Individual).await;
  archive
    .link(NewRelation::new(
      RelationType::ReferencesToIndividuals,
      Source.at(s),
      Individual.at(i),
    ))
    .await
    .unwrap();

  let mut dump = archive.dump();
  dump.entities.retain(|e| e.kind != Individual);
  let err = Archive::restore(NullJournal, dump).err().unwrap();
  assert!(matches!(err, Error::UnknownEntity(r) if r == Individual.at(i)));
}

#[tokio::test]
async fn restore_rejects_cycles() {
  let archive = Archive::in_memory();
  let Chain { root, c, .. } = chain(&archive).await;

  let mut dump: Dump = archive.dump();
  for node in &mut dump.nodes {
    if node.uid == root {
      node.parent = Some(c);
    }
  }
  let err = Archive::restore(NullJournal, dump).err().unwrap();
  assert!(matches!(err, Error::CycleDetected { .. }));
}

#[tokio::test]
async fn restore_rejects_repeated_seq() {
  let archive = Archive::in_memory();
  let Chain { root, a, b, .. } = chain(&archive).await;

  let mut dump = archive.dump();
  let seq = dump.nodes.iter().find(|n| n.uid == a).unwrap().seq;
  for node in &mut dump.nodes {
    if node.uid == b {
      node.parent = Some(root);
      node.seq = seq;
    }
  }
  let err = Archive::restore(NullJournal, dump).err().unwrap();
  assert!(matches!(err, Error::DuplicateKey(_)));
}

#[tokio::test]
async fn exhausted_counters_refuse_new_rows() {
  let archive = Archive::in_memory();
  let t = HierarchyTable::LocationHierarchies;
  let source = make(&archive, Source).await;
  let person = make(&archive, Individual).await;
  let place = make(&archive, Location).await;

  let mut dump = archive.dump();
  dump
    .counters
    .relations
    .insert(RelationType::ReferencesToIndividuals, u64::MAX);
  dump.counters.nodes.insert(t, u64::MAX);
  let restored = Archive::restore(NullJournal, dump).unwrap();

  let err = restored
    .link(NewRelation::new(
      RelationType::ReferencesToIndividuals,
      Source.at(source),
      Individual.at(person),
    ))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Exhausted(_)));
  assert!(restored.edges(RelationType::ReferencesToIndividuals).is_empty());

  let err = restored.attach(t, None, place, Attributes::new()).await.unwrap_err();
  assert!(matches!(err, Error::Exhausted(_)));
  assert!(restored.roots(t).is_empty());

  // A stored seq at the ceiling leaves no room to move anything.
  let archive = Archive::in_memory();
  let Chain { a, b, c, handles, .. } = chain(&archive).await;
  let mut dump = archive.dump();
  for node in &mut dump.nodes {
    if node.uid == c {
      node.seq = u64::MAX;
    }
  }
  let restored = Archive::restore(NullJournal, dump).unwrap();
  let err = restored.detach(handles[2]).await.unwrap_err();
  assert!(matches!(err, Error::Exhausted(_)));
  assert_eq!(restored.ancestors(t, b).unwrap()[0], a);
}

// ─── Queries ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn find_and_distinct_values() {
  let archive = Archive::in_memory();
  for (name, region) in [
    ("Tabriz", "Azerbaijan"),
    ("Maragha", "Azerbaijan"),
    ("Samarqand", "Transoxiana"),
  ] {
    archive
      .create(Location, attrs(json!({ "name": name, "region": region })))
      .await
      .unwrap();
  }

  let hits = archive.find(Location, &["name"], "^Ma|qand$").unwrap();
  let names: Vec<_> = hits.iter().filter_map(|e| e.text("name")).collect();
  assert_eq!(names, vec!["Maragha", "Samarqand"]);

  let hits = archive.find(Location, &[], "Transox").unwrap();
  assert_eq!(hits.len(), 1);

  assert!(matches!(
    archive.find(Location, &["name"], "("),
    Err(Error::InvalidPattern(_))
  ));

  assert_eq!(
    archive.distinct_values(Location, "region"),
    vec!["Azerbaijan".to_owned(), "Transoxiana".to_owned()]
  );
}

#[tokio::test]
async fn find_linked_filters_through_a_relation() {
  let archive = Archive::in_memory();
  let topkapi = archive
    .create(Repository, attrs(json!({ "name": "Topkapi Palace Library" })))
    .await
    .unwrap()
    .uid;
  let paris = archive
    .create(Repository, attrs(json!({ "name": "Bibliotheque nationale" })))
    .await
    .unwrap()
    .uid;

  let mut books = Vec::new();
  for (title, holder) in [
    ("Jami al-tawarikh", topkapi),
    ("Jami al-tawarikh, supplement persan", paris),
    ("Tarikh-i jahangusha", topkapi),
  ] {
    let book = archive
      .create(Bibliography, attrs(json!({ "title": title })))
      .await
      .unwrap()
      .uid;
    archive
      .link(NewRelation::new(
        RelationType::BibliographyRepository,
        Bibliography.at(book),
        Repository.at(holder),
      ))
      .await
      .unwrap();
    books.push(book);
  }
  let uids = |found: Vec<Entity>| found.into_iter().map(|e| e.uid).collect::<Vec<_>>();
  let via = RelationType::BibliographyRepository;

  let hits = archive
    .find_linked(Bibliography, &["title"], "^Jami", via, LinkTarget::Uid(topkapi))
    .unwrap();
  assert_eq!(uids(hits), vec![books[0]]);

  let hits = archive
    .find_linked(Bibliography, &[], "", via, LinkTarget::Pattern("nationale"))
    .unwrap();
  assert_eq!(uids(hits), vec![books[1]]);

  let hits = archive
    .find_linked(Repository, &["name"], "", via, LinkTarget::Pattern("^Tarikh"))
    .unwrap();
  assert_eq!(uids(hits), vec![topkapi]);

  assert!(matches!(
    archive.find_linked(Location, &[], "", via, LinkTarget::Uid(topkapi)),
    Err(Error::NotFound(_))
  ));
}

#[tokio::test]
async fn catalog_counts_rows() {
  let archive = Archive::in_memory();
  chain(&archive).await;

  let catalog = archive.catalog();
  let gazetteer = catalog.iter().find(|s| s.name == "gazetteer").unwrap();
  assert_eq!(gazetteer.rows, 4);
  let hierarchy = catalog
    .iter()
    .find(|s| s.name == "location_hierarchies")
    .unwrap();
  assert_eq!(hierarchy.rows, 4);
  let genre = catalog.iter().find(|s| s.name == "classical_genre").unwrap();
  assert!(genre.foreign_keys.iter().any(|fk| fk.column == "knowledge_form" && fk.mandatory));
}

// ─── Properties ──────────────────────────────────────────────────────────────

fn runtime() -> tokio::runtime::Runtime {
  tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .unwrap()
}

proptest! {
  #[test]
  fn attaching_an_ancestor_below_its_descendant_fails(
    len in 2usize..10,
    picks in (0usize..100, 0usize..100),
  ) {
    let (x, y) = (picks.0 % len, picks.1 % len);
    let (upper, lower) = (x.min(y), x.max(y));

    runtime().block_on(async {
      let archive = Archive::in_memory();
      let t = HierarchyTable::KnowledgeBranch;
      let mut uids = Vec::new();
      for i in 0..len {
        let uid = make(&archive, KnowledgeForm).await;
        let parent = if i == 0 { None } else { Some(uids[i - 1]) };
        archive.attach(t, parent, uid, Attributes::new()).await.unwrap();
        uids.push(uid);
      }

      let err = archive
        .attach(t, Some(uids[lower]), uids[upper], Attributes::new())
        .await
        .unwrap_err();
      assert!(matches!(err, Error::CycleDetected { .. }));
    });
  }

  #[test]
  fn ancestors_exclude_self_and_stay_bounded(
    size in 1usize..12,
    moves in prop::collection::vec((0usize..12, prop::option::of(0usize..12)), 0..40),
  ) {
    runtime().block_on(async {
      let archive = Archive::in_memory();
      let t = HierarchyTable::RelatedTerms;
      let mut handles = Vec::new();
      let mut uids = Vec::new();
      for _ in 0..size {
        let uid = make(&archive, LexiconTerm).await;
        handles.push(archive.attach(t, None, uid, Attributes::new()).await.unwrap());
        uids.push(uid);
      }

      for (node, parent) in moves {
        let handle = handles[node % size];
        let parent = parent.map(|p| uids[p % size]);
        // Cycles are expected to be refused; anything else must succeed.
        if let Err(err) = archive.reparent(handle, parent).await {
          assert!(matches!(err, Error::CycleDetected { .. }), "{err}");
        }
      }

      for &uid in &uids {
        let chain = archive.ancestors(t, uid).unwrap();
        assert!(!chain.contains(&uid));
        assert!(chain.len() < size);
      }
    });
  }
}
