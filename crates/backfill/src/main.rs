use std::env;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use backfill_core::config::{ConfigOverrides, DEFAULT_CONFIG_PATH, ResolvedConfig, load_config};
use backfill_core::migrate::{pending_migration_count, run_migrations};
use backfill_core::sqlite::{
    CheckpointBarrier, NoReplicaBarrier, SqliteMarkers, SqliteStore, open_connection,
    table_exists,
};
use backfill_core::store::{
    CompletionMarkerStore, LineReporter, ProgressReporter, ReplicationBarrier, TracingReporter,
};
use backfill_core::{BackfillDriver, BackfillReport};
use clap::{Args, CommandFactory, Parser, Subcommand};
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "backfill",
    version,
    about = "Chunked, resumable rev_parent_id backfill for MediaWiki revision tables"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "SQLite database file")]
    db: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "TOML config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create or upgrade the revision/updatelog schema")]
    Init,
    #[command(name = "populate-parent-id", about = "Populate rev_parent_id")]
    PopulateParentId(PopulateArgs),
    #[command(about = "Show completion marker and backlog")]
    Status,
    Marker(MarkerArgs),
}

#[derive(Debug, Args)]
struct PopulateArgs {
    #[arg(long, value_name = "N", help = "Rows per window")]
    batch_size: Option<u32>,
    #[arg(long, help = "Run even if the update is logged as completed")]
    force: bool,
    #[arg(long, value_name = "REV_ID", help = "Start from this rev_id instead of the minimum")]
    resume_from: Option<i64>,
    #[arg(long, value_name = "SECS", help = "Upper bound for each replication wait (0 = none)")]
    barrier_timeout: Option<u64>,
    #[arg(
        long,
        conflicts_with = "barrier_timeout",
        help = "Skip the WAL checkpoint wait between windows (no secondary readers)"
    )]
    no_barrier: bool,
    #[arg(long, help = "Print the final report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct MarkerArgs {
    #[command(subcommand)]
    command: MarkerSubcommand,
}

#[derive(Debug, Subcommand)]
enum MarkerSubcommand {
    #[command(about = "Forget the completion marker so the next run does the work again")]
    Clear,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    db: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            db: cli.db.clone(),
            config: cli.config.clone(),
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init) => run_init(&runtime),
        Some(Commands::PopulateParentId(args)) => run_populate(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Marker(MarkerArgs {
            command: MarkerSubcommand::Clear,
        })) => run_marker_clear(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("backfill=info,backfill_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_init(runtime: &RuntimeOptions) -> Result<()> {
    let resolved = resolve_config(runtime, ConfigOverrides::default())?;
    let connection = open_connection(&resolved.db_path)?;
    let report = run_migrations(&connection)?;

    println!("schema init");
    println!("db_path: {}", normalize_path(&resolved.db_path));
    for migration in &report.applied {
        println!("applied: v{:03}_{}", migration.version, migration.name);
    }
    println!("applied.count: {}", report.applied.len());
    println!("schema_version: {}", report.current_version);
    Ok(())
}

fn run_populate(runtime: &RuntimeOptions, args: PopulateArgs) -> Result<()> {
    let resolved = resolve_config(
        runtime,
        ConfigOverrides {
            db_path: None,
            chunk_size: args.batch_size,
            barrier_timeout_secs: args.barrier_timeout,
            force: args.force,
            resume_from: args.resume_from,
        },
    )?;
    let connection = open_existing(&resolved.db_path)?;
    ensure_schema_current(&connection)?;
    tracing::info!(
        db_path = %normalize_path(&resolved.db_path),
        chunk_size = resolved.options.chunk_size.get(),
        force = resolved.options.force,
        "running rev_parent_id backfill"
    );

    let mut checkpoint = CheckpointBarrier::new(&connection);
    let mut no_replica = NoReplicaBarrier;
    let barrier: &mut dyn ReplicationBarrier = if args.no_barrier {
        &mut no_replica
    } else {
        &mut checkpoint
    };
    let report = if args.json {
        populate(&connection, &resolved, barrier, TracingReporter)?
    } else {
        populate(&connection, &resolved, barrier, LineReporter::new(io::stdout()))?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("status: {}", report.status.as_str());
        println!("update_key: {}", report.update_key);
        println!("rows: {}", report.count);
        println!("changed: {}", report.changed);
        println!("windows: {}", report.windows);
        if report.unresolved_below_cursor > 0 {
            println!("unresolved_below_cursor: {}", report.unresolved_below_cursor);
        }
    }
    Ok(())
}

fn populate<B: ReplicationBarrier, P: ProgressReporter>(
    connection: &Connection,
    resolved: &ResolvedConfig,
    barrier: B,
    progress: P,
) -> Result<BackfillReport> {
    let mut driver = BackfillDriver::new(
        SqliteStore::new(connection),
        barrier,
        SqliteMarkers::new(connection),
        progress,
        resolved.options.clone(),
    );
    driver
        .run()
        .with_context(|| format!("backfill failed for {}", normalize_path(&resolved.db_path)))
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let resolved = resolve_config(runtime, ConfigOverrides::default())?;
    let connection = open_existing(&resolved.db_path)?;
    let key = &resolved.options.update_key;

    println!("backfill status");
    println!("db_path: {}", normalize_path(&resolved.db_path));
    println!("pending_migrations: {}", pending_migration_count(&connection)?);
    println!("update_key: {key}");
    if table_exists(&connection, "updatelog")? {
        println!(
            "completed: {}",
            format_flag(SqliteMarkers::new(&connection).is_set(key)?)
        );
    } else {
        println!("completed: n/a (updatelog missing)");
    }
    if table_exists(&connection, "revision")? {
        let store = SqliteStore::new(&connection);
        println!("revisions: {}", store.revision_count()?);
        println!("unresolved: {}", store.unresolved_count()?);
    } else {
        println!("revisions: n/a (revision table missing)");
    }
    println!("chunk_size: {}", resolved.options.chunk_size);
    Ok(())
}

fn run_marker_clear(runtime: &RuntimeOptions) -> Result<()> {
    let resolved = resolve_config(runtime, ConfigOverrides::default())?;
    let connection = open_existing(&resolved.db_path)?;
    ensure_schema_current(&connection)?;
    let key = &resolved.options.update_key;

    let removed = SqliteMarkers::new(&connection).clear(key)?;
    println!("update_key: {key}");
    println!("cleared: {}", format_flag(removed));
    Ok(())
}

fn resolve_config(
    runtime: &RuntimeOptions,
    mut overrides: ConfigOverrides,
) -> Result<ResolvedConfig> {
    dotenvy::dotenv().ok();

    let cwd = env::current_dir().context("failed to read current directory")?;
    let config_path = match &runtime.config {
        Some(path) => path.clone(),
        None => cwd.join(DEFAULT_CONFIG_PATH),
    };
    if runtime.config.is_some() && !config_path.exists() {
        bail!("config file not found: {}", normalize_path(&config_path));
    }
    let loaded = load_config(&config_path)?;
    let base_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.clone());

    overrides.db_path = runtime.db.clone();
    loaded.resolve(&base_dir, &overrides)
}

fn open_existing(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        bail!(
            "database not found: {}\nRun: backfill init --db {}",
            normalize_path(db_path),
            normalize_path(db_path)
        );
    }
    open_connection(db_path)
}

fn ensure_schema_current(connection: &Connection) -> Result<()> {
    let pending = pending_migration_count(connection)?;
    if pending > 0 {
        bail!("{pending} schema migration(s) pending. Run `backfill init` first.");
    }
    Ok(())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
