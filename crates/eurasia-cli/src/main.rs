//! `eurasia`: command-line access to an archive journal.
//!
//! Reads `eurasia.toml` (or the path given with `--config`) and `EURASIA_*`
//! environment variables, opens the SQLite journal, verifies it, and runs
//! one command. Results are printed as JSON.
//!
//! # Usage
//!
//! ```
//! eurasia import records.jsonl
//! eurasia find location "^Tabr" --field name
//! eurasia find bibliography Rashid --via bibliography_repository --linked Topkapi
//! eurasia descendants location_hierarchies 12
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use eurasia_core::{
  Archive,
  entity::{EntityKind, Uid},
  import::Importer,
  query::LinkTarget,
  relation::Direction,
  schema::{HierarchyTable, RelationType},
};
use eurasia_store_sqlite::SqliteJournal;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(author, version, about = "Medieval Eurasia archive")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "eurasia.toml")]
  config: PathBuf,

  /// SQLite journal to open; overrides `store_path` from the config.
  #[arg(long, value_name = "FILE")]
  store: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Load JSON-lines records; records may arrive in any order.
  Import { file: PathBuf },
  /// List every table with its row count and foreign keys.
  Info,
  /// Print one entity.
  Get { kind: EntityKind, uid: u64 },
  /// Regex search over string attributes of one kind.
  Find {
    kind:    EntityKind,
    pattern: String,
    /// Attribute to search; repeatable. Searches all when omitted.
    #[arg(short, long = "field")]
    fields:  Vec<String>,
    /// Keep only entities joined through this relation type.
    #[arg(long, requires = "linked")]
    via:     Option<RelationType>,
    /// UID or regex selecting the entity on the far side of `--via`.
    #[arg(long, requires = "via")]
    linked:  Option<String>,
  },
  /// Distinct values of one attribute.
  Values { kind: EntityKind, field: String },
  /// Ancestors of a node, nearest first.
  Ancestors { table: HierarchyTable, uid: u64 },
  /// Descendants of a node in pre-order.
  Descendants { table: HierarchyTable, uid: u64 },
  /// Path between two nodes of one hierarchy.
  Path { table: HierarchyTable, from: u64, to: u64 },
  /// Entities linked to `uid` through one relation type.
  Related {
    relation_type: RelationType,
    uid:           u64,
    /// Follow edges backwards, from `to` to `from`.
    #[arg(long)]
    incoming:      bool,
  },
  /// Dump every row as JSON.
  Export,
}

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Settings {
  #[serde(default = "default_store_path")]
  store_path: PathBuf,
}

fn default_store_path() -> PathBuf { PathBuf::from("eurasia.sqlite") }

#[derive(Serialize)]
struct ImportSummary {
  entities:   usize,
  relations:  usize,
  nodes:      usize,
  unchanged:  usize,
  rejected:   Vec<String>,
  unresolved: Vec<String>,
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings: Settings = config::Config::builder()
    .add_source(config::File::from(cli.config.clone()).required(false))
    .add_source(config::Environment::with_prefix("EURASIA"))
    .build()
    .context("failed to read config file")?
    .try_deserialize()
    .context("failed to deserialise Settings")?;

  let store_path = expand_tilde(cli.store.as_deref().unwrap_or(&settings.store_path));
  let archive = SqliteJournal::open(&store_path)
    .await
    .with_context(|| format!("failed to open journal at {store_path:?}"))?
    .into_archive()
    .await
    .with_context(|| format!("journal at {store_path:?} failed verification"))?;
  tracing::debug!(path = ?store_path, "archive opened");

  run(&archive, cli.command).await
}

async fn run(archive: &Archive<SqliteJournal>, command: Command) -> anyhow::Result<()> {
  match command {
    Command::Import { file } => {
      let raw = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
      let mut importer = Importer::new(archive);
      for (n, line) in raw.lines().enumerate() {
        importer
          .submit_line(line)
          .await
          .with_context(|| format!("{}:{}", file.display(), n + 1))?;
      }
      let report = importer.finish();
      let describe = |(record, err): &(_, eurasia_core::Error)| -> String {
        format!("{err}: {}", serde_json::to_string(record).unwrap_or_default())
      };
      print_json(&ImportSummary {
        entities:   report.entities,
        relations:  report.relations,
        nodes:      report.nodes,
        unchanged:  report.unchanged,
        rejected:   report.rejected.iter().map(describe).collect(),
        unresolved: report.unresolved.iter().map(describe).collect(),
      })
    }
    Command::Info => print_json(&archive.catalog()),
    Command::Get { kind, uid } => print_json(&archive.get(kind, Uid(uid))?),
    Command::Find { kind, pattern, fields, via, linked } => {
      let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
      let found = match (via, linked.as_deref()) {
        (Some(relation_type), Some(linked)) => {
          let target = match linked.parse() {
            Ok(uid) => LinkTarget::Uid(Uid(uid)),
            Err(_) => LinkTarget::Pattern(linked),
          };
          archive.find_linked(kind, &fields, &pattern, relation_type, target)?
        }
        _ => archive.find(kind, &fields, &pattern)?,
      };
      print_json(&found)
    }
    Command::Values { kind, field } => print_json(&archive.distinct_values(kind, &field)),
    Command::Ancestors { table, uid } => print_json(&archive.ancestors(table, Uid(uid))?),
    Command::Descendants { table, uid } => {
      print_json(&archive.descendants(table, Uid(uid))?.to_vec())
    }
    Command::Path { table, from, to } => {
      print_json(&archive.path(table, Uid(from), Uid(to))?)
    }
    Command::Related { relation_type, uid, incoming } => {
      let direction = if incoming { Direction::Incoming } else { Direction::Outgoing };
      print_json(&archive.neighbors(Uid(uid), relation_type, direction).to_vec())
    }
    Command::Export => print_json(&archive.dump()),
  }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
