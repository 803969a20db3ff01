use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tablesync::config::Config;
use tablesync::export::Exporter;
use tablesync::io::http::HttpRemote;
use tablesync::io::remote::RemoteApi;
use tablesync::io::store::SqliteStore;
use tablesync::io::workbook_read::WorkbookRemote;
use tablesync::io::workbook_write;
use tablesync::snapshot::build_snapshot;
use tablesync::sync::{LogObserver, Orchestrator, RunMode};
use tablesync::{Result, SyncError};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    if let Err(error) = init_tracing().and_then(|()| run(cli)) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| SyncError::Logging(error.to_string()))
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Import(args) => execute_import(args),
        Command::Export(args) => execute_export(args),
        Command::Snapshot(args) => execute_snapshot(args),
    }
}

fn load_config(path: &Path, debug: bool) -> Result<Config> {
    let mut config = Config::load(path)?;
    config.debug |= debug;
    Ok(config)
}

fn execute_import(args: ImportArgs) -> Result<()> {
    let config = load_config(&args.config, args.debug)?;
    let api: Box<dyn RemoteApi> = match &args.workbook {
        Some(path) => Box::new(WorkbookRemote::open(path)?),
        None => Box::new(HttpRemote::new(&config.remote)?),
    };
    let mut store = SqliteStore::open(&args.db)?;
    let mode = if args.full { RunMode::Full } else { RunMode::Default };

    let mut orchestrator = Orchestrator::new(&config, api.as_ref(), &mut store);
    orchestrator.add_observer(Box::new(LogObserver));
    let report = orchestrator.run(mode)?;

    for step in &report.steps {
        let stats = step.stats;
        println!(
            "{:<12} created {:>5}  updated {:>5}  unchanged {:>5}  unlinked {:>5}  placeholders {:>5}  orphaned {:>5}  failed {:>5}",
            step.kind.as_str(),
            stats.created,
            stats.updated,
            stats.unchanged,
            stats.unlinked,
            stats.placeholders,
            stats.orphaned,
            stats.failed,
        );
    }
    for failure in &report.failures {
        println!(
            "{} {} {}: {}",
            failure.error_kind,
            failure.kind.map(|kind| kind.as_str()).unwrap_or("-"),
            failure.external_id.as_deref().unwrap_or("-"),
            failure.message
        );
    }
    Ok(())
}

fn execute_export(args: ExportArgs) -> Result<()> {
    let config = load_config(&args.config, args.debug)?;
    let api = HttpRemote::new(&config.remote)?;
    let mut store = SqliteStore::open(&args.db)?;

    let report = Exporter::new(&config, &api, &mut store).run()?;
    for step in &report.steps {
        let stats = step.stats;
        println!(
            "{:<12} created {:>5}  updated {:>5}  linked {:>5}  skipped {:>5}  failed {:>5}",
            step.kind.as_str(),
            stats.created,
            stats.updated,
            stats.linked,
            stats.skipped,
            stats.failed,
        );
    }
    for failure in &report.failures {
        println!("{} {}", failure.error_kind, failure.message);
    }
    Ok(())
}

fn execute_snapshot(args: SnapshotArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    let store = SqliteStore::open(&args.db)?;
    let workbook = build_snapshot(&config, &store)?;
    workbook_write::write_workbook(&args.output, &workbook)?;
    info!(output = %args.output.display(), "snapshot written");
    Ok(())
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Synchronise a remote table service with a local evidence store."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull remote rows into the local store.
    Import(ImportArgs),
    /// Push local changes to the remote tables.
    Export(ExportArgs),
    /// Write the local store as a workbook that `import --workbook` reads.
    Snapshot(SnapshotArgs),
}

#[derive(clap::Args)]
struct ImportArgs {
    /// TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// SQLite database holding the local store.
    #[arg(long)]
    db: PathBuf,

    /// Also import optional kinds (evidence and sources by default).
    #[arg(long)]
    full: bool,

    /// Keep going past row and step failures and report them at the end.
    #[arg(long)]
    debug: bool,

    /// Read rows from a workbook snapshot instead of the remote service.
    #[arg(long)]
    workbook: Option<PathBuf>,
}

#[derive(clap::Args)]
struct ExportArgs {
    /// TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// SQLite database holding the local store.
    #[arg(long)]
    db: PathBuf,

    /// Keep going past record failures and report them at the end.
    #[arg(long)]
    debug: bool,
}

#[derive(clap::Args)]
struct SnapshotArgs {
    /// TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// SQLite database holding the local store.
    #[arg(long)]
    db: PathBuf,

    /// Workbook to write.
    #[arg(long)]
    output: PathBuf,
}
