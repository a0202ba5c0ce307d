//! The declarative catalog of relation types and hierarchy tables.
//!
//! Every foreign key the archive knows about is described here as data.
//! The integrity checks in [`crate::integrity`] are driven entirely by this
//! catalog, so adding a relation type means adding a row to [`CATALOG`],
//! not writing new validation code.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::entity::EntityKind::{self, *};

// ─── Relation types ──────────────────────────────────────────────────────────

/// A fact table: a typed, directed edge between two entities.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumIter,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelationType {
  IndividualSocialRoles,
  RoleHonorific,
  Seals,
  ReferencesToIndividuals,
  ReferencesToLocations,
  ReferencesToTerms,
  ReferencesToPowers,
  RelatedSources,
  CopiesHoldings,
  LocationAttributes,
  Conquests,
  KnowledgeMastery,
  ClassicalGenre,
  Definitions,
  LocationTertiary,
  BranchClassical,
  BibliographyRepository,
}

/// An extra foreign-key column on a relation, beyond `from` and `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
  pub name:      &'static str,
  pub kind:      EntityKind,
  pub mandatory: bool,
}

impl Slot {
  pub const fn mandatory(name: &'static str, kind: EntityKind) -> Self {
    Self { name, kind, mandatory: true }
  }

  pub const fn optional(name: &'static str, kind: EntityKind) -> Self {
    Self { name, kind, mandatory: false }
  }
}

/// The static shape of one relation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationSchema {
  pub relation_type: RelationType,
  pub from:          EntityKind,
  pub to:            EntityKind,
  pub slots:         &'static [Slot],
}

impl RelationSchema {
  /// Every entity kind this relation type can point at.
  pub fn referenced_kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
    [self.from, self.to]
      .into_iter()
      .chain(self.slots.iter().map(|s| s.kind))
  }

  pub fn references(&self, kind: EntityKind) -> bool {
    self.referenced_kinds().any(|k| k == kind)
  }

  pub fn slot(&self, name: &str) -> Option<&'static Slot> {
    self.slots.iter().find(|s| s.name == name)
  }
}

const fn rel(
  relation_type: RelationType,
  from: EntityKind,
  to: EntityKind,
  slots: &'static [Slot],
) -> RelationSchema {
  RelationSchema { relation_type, from, to, slots }
}

const CITED_IN: &[Slot] = &[Slot::optional("source", Source)];
const CATALOGUED_IN: &[Slot] = &[Slot::optional("bibliography", Bibliography)];
const HELD_UNDER: &[Slot] =
  &[Slot::optional("power", Power), Slot::optional("epoch", Epoch)];
const DURING: &[Slot] = &[Slot::optional("epoch", Epoch)];
const GENRE_OF: &[Slot] = &[Slot::mandatory("knowledge_form", KnowledgeForm)];

/// Indexed by `RelationType as usize`; the order must match the enum.
pub static CATALOG: [RelationSchema; 17] = [
  rel(RelationType::IndividualSocialRoles, Individual, SocialRole, CITED_IN),
  rel(RelationType::RoleHonorific, SocialRole, Honorific, &[]),
  rel(RelationType::Seals, Individual, Source, &[]),
  rel(RelationType::ReferencesToIndividuals, Source, Individual, &[]),
  rel(RelationType::ReferencesToLocations, Source, Location, &[]),
  rel(RelationType::ReferencesToTerms, Source, LexiconTerm, &[]),
  rel(RelationType::ReferencesToPowers, Source, Power, &[]),
  rel(RelationType::RelatedSources, Source, Source, &[]),
  rel(RelationType::CopiesHoldings, Source, Repository, CATALOGUED_IN),
  rel(RelationType::LocationAttributes, Location, Territory, HELD_UNDER),
  rel(RelationType::Conquests, Power, Location, DURING),
  rel(RelationType::KnowledgeMastery, Individual, KnowledgeForm, CITED_IN),
  rel(RelationType::ClassicalGenre, Source, ClassicalSource, GENRE_OF),
  rel(RelationType::Definitions, LexiconTerm, Bibliography, &[]),
  rel(RelationType::LocationTertiary, Location, Location, &[]),
  rel(RelationType::BranchClassical, KnowledgeForm, ClassicalSource, &[]),
  rel(RelationType::BibliographyRepository, Bibliography, Repository, &[]),
];

impl RelationType {
  pub fn schema(self) -> &'static RelationSchema { &CATALOG[self as usize] }

  /// Relation types with at least one column pointing at `kind`.
  pub fn referencing(kind: EntityKind) -> impl Iterator<Item = RelationType> {
    Self::iter().filter(move |t| t.schema().references(kind))
  }
}

// ─── Hierarchy tables ────────────────────────────────────────────────────────

/// A self-referential parent/child table. Each is an independent forest.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumIter,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HierarchyTable {
  LocationHierarchies,
  KnowledgeBranch,
  RelatedTerms,
}

impl HierarchyTable {
  /// The entity kind whose UIDs populate this table's node space.
  pub fn member(self) -> EntityKind {
    match self {
      Self::LocationHierarchies => Location,
      Self::KnowledgeBranch => KnowledgeForm,
      Self::RelatedTerms => LexiconTerm,
    }
  }
}

// ─── Table ids ───────────────────────────────────────────────────────────────

/// Every independently lockable table. The derived order is the global lock
/// order used by writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableId {
  Entity(EntityKind),
  Relation(RelationType),
  Hierarchy(HierarchyTable),
}

impl TableId {
  pub fn name(self) -> &'static str {
    match self {
      Self::Entity(kind) => kind.table(),
      Self::Relation(t) => t.into(),
      Self::Hierarchy(h) => h.into(),
    }
  }
}
