//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use catalogsync_core::{
    RunRegistry, RunStatus, SyncMode, SyncObserver, SyncOptions, SyncReport, SyncRun,
    Synchronizer,
};
use catalogsync_shared::{
    AppConfig, CacheBackend, SyncSettings, expand_home, init_config, load_config,
    load_config_from,
};
use catalogsync_storage::{SqliteStore, StoreStats, build_store, schema_sql};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// catalogsync: keep a cached copy of a Notion music catalog in sync.
#[derive(Parser)]
#[command(
    name = "catalogsync",
    version,
    about = "Incrementally sync a Notion catalog database into a cache, with Bilibili covers.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.catalogsync/catalogsync.toml.
    #[arg(long, env = "CATALOGSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Fetch upstream records, merge them into the baseline and look up covers.
    Sync {
        /// Treat every record as new and refetch every cover.
        #[arg(long)]
        full: bool,

        /// Time budget for this run in seconds (overrides sync.time_budget_secs).
        #[arg(long)]
        budget_secs: Option<u64>,

        /// Skip cover lookups for this run.
        #[arg(long)]
        no_covers: bool,

        /// Print the run statistics as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },

    /// Show counts for the cached baseline.
    Stats,

    /// Delete the local baseline file and database.
    Clean,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Print the SQL that creates or upgrades the Supabase tables.
    Schema,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "catalogsync=info",
        1 => "catalogsync=debug",
        _ => "catalogsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Sync {
            full,
            budget_secs,
            no_covers,
            json,
        } => {
            let options = SyncOptions {
                mode: if full { SyncMode::Full } else { SyncMode::Incremental },
                time_budget: budget_secs.map(Duration::from_secs),
            };
            cmd_sync(config_path, options, no_covers, json).await
        }
        Command::Stats => cmd_stats(config_path).await,
        Command::Clean => cmd_clean(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
            ConfigAction::Schema => cmd_config_schema(config_path).await,
        },
    }
}

fn read_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_sync(
    config_path: Option<&Path>,
    options: SyncOptions,
    no_covers: bool,
    json: bool,
) -> Result<()> {
    let config = read_config(config_path)?;

    // Config errors surface here, before any network call.
    let mut settings = SyncSettings::resolve(&config)?;
    if no_covers {
        settings.covers.enabled = false;
    }

    let store = build_store(&config).await?;
    let registry = RunRegistry::new(settings.run_retention);
    let synchronizer = Synchronizer::from_settings(settings, store)?;

    info!(
        sources = synchronizer.settings().notion.database_ids.len(),
        mode = ?options.mode,
        "starting catalog sync"
    );

    let progress = CliProgress::new(json);
    let report = synchronizer.run(&registry, &progress, options).await;
    progress.finish();
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.stats)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    let s = &report.stats;
    println!();
    println!("  Sync complete{}", if report.truncated { " (truncated)" } else { "" });
    println!("  Run:        {}", report.run_id);
    println!("  Fetched:    {} records in {} pages", s.total_fetched, s.pages);
    println!("  New:        {}", s.new_records);
    println!("  Changed:    {}", s.changed_records);
    println!("  Unchanged:  {}", s.unchanged_records);
    if s.unidentified_records > 0 {
        println!("  No BV id:   {}", s.unidentified_records);
    }
    println!(
        "  Covers:     {} found, {} failed, {} pending",
        s.cover_successes, s.cover_failures, s.cover_pending
    );
    match &s.persist_error {
        None => println!("  Baseline:   {} records saved", report.baseline.len()),
        Some(e) => println!("  Baseline:   NOT saved ({e})"),
    }
    println!("  Time:       {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

async fn cmd_stats(config_path: Option<&Path>) -> Result<()> {
    let config = read_config(config_path)?;

    // The sqlite backend counts in SQL instead of loading every record.
    let (store_name, stats, last_sync) = match config.cache.backend {
        CacheBackend::Sqlite => {
            let store = SqliteStore::open(&expand_home(&config.cache.sqlite_path)).await?;
            ("sqlite".to_string(), store.stats().await?, store.last_sync().await?)
        }
        CacheBackend::Supabase | CacheBackend::None => {
            let store = build_store(&config).await?;
            let baseline = store.load().await?;
            (
                store.name().to_string(),
                StoreStats::from_baseline(&baseline),
                baseline.last_sync,
            )
        }
    };

    println!();
    println!("  Store:          {store_name}");
    println!("  Records:        {}", stats.records);
    println!("  With cover:     {}", stats.with_cover);
    println!("  Cover given up: {}", stats.cover_exhausted);
    println!("  Without BV id:  {}", stats.unidentified);
    match last_sync {
        Some(t) => println!("  Last sync:      {}", t.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Last sync:      never"),
    }
    println!();
    Ok(())
}

async fn cmd_clean(config_path: Option<&Path>) -> Result<()> {
    let config = read_config(config_path)?;
    let targets = [
        expand_home(&config.cache.local_path),
        expand_home(&config.cache.sqlite_path),
    ];

    let mut removed = 0usize;
    for path in &targets {
        match std::fs::remove_file(path) {
            Ok(()) => {
                removed += 1;
                info!(path = %path.display(), "removed local cache file");
                println!("  Removed: {}", path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(eyre!("failed to remove {}: {e}", path.display())),
        }
    }

    if removed == 0 {
        println!("  Nothing to clean.");
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = read_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

async fn cmd_config_schema(config_path: Option<&Path>) -> Result<()> {
    let config = read_config(config_path)?;
    println!("{}", schema_sql(&config.supabase.table));
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Run observer that drives an indicatif bar from run snapshots.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(100)
        };
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl SyncObserver for CliProgress {
    fn on_update(&self, run: &SyncRun) {
        self.bar.set_position(u64::from(run.progress));
        let phase = run.phase.map_or("starting", |p| p.as_str());
        let msg = match run.status {
            RunStatus::Failed => format!("failed during {phase}"),
            _ if run.stats.total_fetched > 0 => {
                format!("{phase} ({} records)", run.stats.total_fetched)
            }
            _ => phase.to_string(),
        };
        self.bar.set_message(msg);
    }
}
