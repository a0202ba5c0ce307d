//! SQL schema for the Eurasia SQLite journal.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
///
/// Referential integrity is enforced by the archive before a change reaches
/// the journal, so the tables carry no `REFERENCES` clauses: rows of every
/// kind share one table and a declarative foreign key cannot express the
/// catalog.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS entities (
    kind        TEXT    NOT NULL,   -- EntityKind, snake_case
    uid         INTEGER NOT NULL,
    version     INTEGER NOT NULL,
    attributes  TEXT    NOT NULL,   -- JSON object
    created_at  TEXT    NOT NULL,   -- RFC 3339 UTC
    updated_at  TEXT    NOT NULL,
    PRIMARY KEY (kind, uid)
);

-- Relation rows are inserted and deleted, never updated.
CREATE TABLE IF NOT EXISTS relations (
    relation_type TEXT    NOT NULL,
    id            INTEGER NOT NULL,
    from_kind     TEXT    NOT NULL,
    from_uid      INTEGER NOT NULL,
    to_kind       TEXT    NOT NULL,
    to_uid        INTEGER NOT NULL,
    refs          TEXT    NOT NULL DEFAULT '{}',   -- slot name -> entity ref
    attributes    TEXT    NOT NULL DEFAULT '{}',
    recorded_at   TEXT    NOT NULL,
    PRIMARY KEY (relation_type, id)
);

CREATE TABLE IF NOT EXISTS hierarchy_nodes (
    hierarchy   TEXT    NOT NULL,
    uid         INTEGER NOT NULL,
    handle      INTEGER NOT NULL,
    parent_uid  INTEGER,            -- NULL for roots
    seq         INTEGER NOT NULL,
    attributes  TEXT    NOT NULL DEFAULT '{}',
    recorded_at TEXT    NOT NULL,
    PRIMARY KEY (hierarchy, uid),
    UNIQUE (hierarchy, handle)
);

-- Allocator high-water marks; only ever raised.
CREATE TABLE IF NOT EXISTS sequences (
    scope TEXT    NOT NULL,         -- 'entity' | 'relation' | 'node'
    name  TEXT    NOT NULL,
    next  INTEGER NOT NULL,
    PRIMARY KEY (scope, name)
);

CREATE INDEX IF NOT EXISTS relations_from_idx ON relations(from_kind, from_uid);
CREATE INDEX IF NOT EXISTS relations_to_idx   ON relations(to_kind, to_uid);
CREATE INDEX IF NOT EXISTS nodes_parent_idx   ON hierarchy_nodes(hierarchy, parent_uid);

PRAGMA user_version = 1;
";
