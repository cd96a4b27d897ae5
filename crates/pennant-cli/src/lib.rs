//! Command surface for the archive.
//!
//! Host tooling should embed behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_query`] / [`run_entity`] for direct command execution against an
//!   open [`ArchiveStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pennant_core::{
    value_text, EntityId, EntityType, NormalizedRecord, Season, SyncStatus, TournamentContext,
};
use pennant_store_sqlite::{default_sync_tables, ArchiveStore, SqliteSourceStore};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "pennant")]
#[command(about = "Archival tournament records CLI")]
pub struct Cli {
    /// Path to the read-optimized archive database.
    #[arg(long, default_value = "./pennant_archive.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replace archive snapshot tables from a source database.
    Sync(SyncArgs),
    Entity {
        #[command(subcommand)]
        command: Box<EntityCommand>,
    },
    Query {
        #[command(subcommand)]
        command: Box<QueryCommand>,
    },
    /// Load the full drill-down bundle for one entity in a tournament.
    Detail(DetailArgs),
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Path to the source-of-truth database.
    #[arg(long)]
    source: PathBuf,
    /// Tables to copy, in order. Defaults to the full snapshot set.
    #[arg(long = "table")]
    tables: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum EntityCommand {
    Register(EntityRegisterArgs),
    AddAlias(EntityAliasArgs),
    LinkKey(EntityLinkKeyArgs),
    Show(EntityShowArgs),
    Find(EntityFindArgs),
}

#[derive(Debug, Args)]
pub struct EntityRegisterArgs {
    #[arg(long = "type")]
    entity_type: EntityTypeArg,
    #[arg(long)]
    name: String,
    #[arg(long)]
    last_active_year: Option<i64>,
}

#[derive(Debug, Args)]
pub struct EntityAliasArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    alias: String,
}

#[derive(Debug, Args)]
pub struct EntityLinkKeyArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    key: String,
}

#[derive(Debug, Args)]
pub struct EntityShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct EntityFindArgs {
    #[arg(long = "type")]
    entity_type: EntityTypeArg,
    #[arg(long)]
    query: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    Tournament(QueryTournamentArgs),
    School(QueryEntityArgs),
    Player(QueryEntityArgs),
    Cohort(QueryCohortArgs),
}

#[derive(Debug, Args)]
pub struct QueryTournamentArgs {
    #[arg(long)]
    year: String,
    #[arg(long)]
    season: SeasonArg,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct QueryEntityArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct QueryCohortArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DetailArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    year: String,
    #[arg(long)]
    season: SeasonArg,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EntityTypeArg {
    School,
    Player,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SeasonArg {
    Spring,
    Summer,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open, migration, or command execution fails.
/// A sync that stops at a failing table is reported and then surfaced as an
/// error so the process exits nonzero.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Sync(args) => run_sync(&cli.db, args),
        Command::Entity { command } => {
            let store = open_store(&cli.db)?;
            run_entity(*command, &store)
        }
        Command::Query { command } => {
            let store = open_store(&cli.db)?;
            run_query(*command, &store)
        }
        Command::Detail(args) => {
            let store = open_store(&cli.db)?;
            run_detail(args, &store)
        }
    }
}

fn open_store(db_path: &Path) -> Result<ArchiveStore> {
    let store = ArchiveStore::open(db_path)?;
    store.migrate()?;
    Ok(store)
}

fn run_sync(db_path: &Path, args: SyncArgs) -> Result<()> {
    let source = SqliteSourceStore::open(&args.source)?;
    let mut store = open_store(db_path)?;

    let sync_list = if args.tables.is_empty() {
        default_sync_tables()
    } else {
        args.tables
    };

    let json = args.json;
    let report = store.sync_tables(&source, &sync_list, &mut |progress| {
        if !json {
            println!(
                "synced {} ({:.0}%)",
                progress.table,
                progress.fraction * 100.0
            );
        }
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "status={} completed={}/{}",
            report.status.as_str(),
            report.tables_completed.len(),
            report.tables.len()
        );
    }

    if report.status == SyncStatus::Failed {
        return Err(anyhow!(
            "sync stopped at table {}: {}",
            report.failed_table.as_deref().unwrap_or("<unknown>"),
            report.failure.as_deref().unwrap_or("<no detail>")
        ));
    }
    Ok(())
}

/// Executes a parsed entity command against an open store.
///
/// # Errors
/// Returns an error when validation or persistence fails, or when a `show`
/// target does not exist.
pub fn run_entity(command: EntityCommand, store: &ArchiveStore) -> Result<()> {
    match command {
        EntityCommand::Register(args) => {
            let entity_id = store.register_entity(
                map_entity_type(args.entity_type),
                &args.name,
                args.last_active_year,
            )?;
            let Some(entity) = store.get_entity(entity_id)? else {
                return Err(anyhow!("registered entity {entity_id} not readable"));
            };
            println!("{}", serde_json::to_string_pretty(&entity)?);
            Ok(())
        }
        EntityCommand::AddAlias(args) => {
            let entity_id = parse_entity_id(&args.id)?;
            store.add_alias(entity_id, &args.alias)?;
            show_entity(store, entity_id)
        }
        EntityCommand::LinkKey(args) => {
            let entity_id = parse_entity_id(&args.id)?;
            store.link_physical_key(entity_id, &args.key)?;
            show_entity(store, entity_id)
        }
        EntityCommand::Show(args) => {
            let entity_id = parse_entity_id(&args.id)?;
            show_entity(store, entity_id)
        }
        EntityCommand::Find(args) => {
            let candidates = store.find_candidates(
                map_entity_type(args.entity_type),
                &args.query,
                args.limit,
            )?;
            println!("{}", serde_json::to_string_pretty(&candidates)?);
            Ok(())
        }
    }
}

/// Executes a parsed query command against an open store.
///
/// # Errors
/// Returns an error when the entity handle is unknown or the query fails.
/// An empty result set is printed, not an error.
pub fn run_query(command: QueryCommand, store: &ArchiveStore) -> Result<()> {
    match command {
        QueryCommand::Tournament(args) => {
            let ctx = TournamentContext::new(&args.year, map_season(args.season));
            let rows = store.by_tournament(&ctx)?;
            print_records(&rows, args.json)
        }
        QueryCommand::School(args) => {
            let entity = require_entity(store, &args.id)?;
            let rows = store.by_school_entity(&entity)?;
            print_records(&rows, args.json)
        }
        QueryCommand::Player(args) => {
            let entity = require_entity(store, &args.id)?;
            let rows = store.by_player_entity(&entity)?;
            print_records(&rows, args.json)
        }
        QueryCommand::Cohort(args) => {
            let rows = store.by_cohort(&args.key)?;
            print_records(&rows, args.json)
        }
    }
}

fn run_detail(args: DetailArgs, store: &ArchiveStore) -> Result<()> {
    let entity_id = parse_entity_id(&args.id)?;
    let ctx = TournamentContext::new(&args.year, map_season(args.season));

    let Some(bundle) = store.load_detail(entity_id, &ctx)? else {
        return Err(anyhow!("no entity matches {entity_id}"));
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&bundle)?);
        return Ok(());
    }

    for (name, section) in [
        ("context_games", &bundle.context_games),
        ("history", &bundle.history),
        ("roster", &bundle.roster),
    ] {
        match &section.error {
            Some(message) => println!("[{name}] unavailable: {message}"),
            None => {
                println!("[{name}]");
                print_record_table(&section.rows);
            }
        }
    }
    Ok(())
}

fn show_entity(store: &ArchiveStore, entity_id: EntityId) -> Result<()> {
    let Some(entity) = store.get_entity(entity_id)? else {
        return Err(anyhow!("no entity matches {entity_id}"));
    };
    println!("{}", serde_json::to_string_pretty(&entity)?);
    Ok(())
}

fn require_entity(store: &ArchiveStore, raw_id: &str) -> Result<pennant_core::CanonicalEntity> {
    let entity_id = parse_entity_id(raw_id)?;
    store
        .get_entity(entity_id)?
        .ok_or_else(|| anyhow!("no entity matches {entity_id}"))
}

fn parse_entity_id(raw: &str) -> Result<EntityId> {
    EntityId::parse(raw).with_context(|| format!("invalid entity id: {raw}"))
}

fn map_entity_type(value: EntityTypeArg) -> EntityType {
    match value {
        EntityTypeArg::School => EntityType::School,
        EntityTypeArg::Player => EntityType::Player,
    }
}

fn map_season(value: SeasonArg) -> Season {
    match value {
        SeasonArg::Spring => Season::Spring,
        SeasonArg::Summer => Season::Summer,
    }
}

fn print_records(rows: &[NormalizedRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_record_table(rows);
    }
    Ok(())
}

fn print_record_table(rows: &[NormalizedRecord]) {
    println!("rows={}", rows.len());
    let Some(first) = rows.first() else {
        return;
    };

    let columns: Vec<&String> = first.keys().collect();
    println!(
        "{}",
        columns
            .iter()
            .map(|column| column.as_str())
            .collect::<Vec<_>>()
            .join(" | ")
    );
    println!("{}", "-".repeat(80));
    for row in rows {
        let line = columns
            .iter()
            .map(|column| value_text(row.get(column.as_str()).unwrap_or(&Value::Null)))
            .collect::<Vec<_>>()
            .join(" | ");
        println!("{line}");
    }
}
