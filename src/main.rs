//! nftpolicy - cluster-wide network policies as nftables rulesets
//!
//! # Usage
//!
//! ```bash
//! # Print the ruleset for a cluster state file
//! nftpolicy compile --state state.json --sets sets.json
//!
//! # Report whether the applied ruleset is stale
//! nftpolicy check --state state.json --snapshots snapshots.json
//!
//! # Reconcile continuously until Ctrl-C
//! nftpolicy run --state state.json --sets sets.json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use nftpolicy::audit::AuditLog;
use nftpolicy::config::{self, ControllerConfig};
use nftpolicy::core::apply::NftApplier;
use nftpolicy::core::detector::detect;
use nftpolicy::core::render::Ruleset;
use nftpolicy::core::resolver::{self, FqdnCache};
use nftpolicy::core::snapshot::SnapshotStore;
use nftpolicy::scheduler::{FileSource, PolicySource, Reconciler, Scheduler};
use nftpolicy::utils;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, info, warn};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "nftpolicy")]
#[command(version = build::CLAP_LONG_VERSION)]
#[command(about = "Compiles cluster-wide network policies into nftables rulesets", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    /// nftables ruleset text
    Nft,
    /// Policies as compiled, with their resolved sets
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a cluster state file and print the ruleset
    Compile {
        /// Cluster state (policies, services, firewall spec) as JSON
        #[arg(short, long)]
        state: PathBuf,
        /// FQDN resolutions as a JSON array of selector entries
        #[arg(long)]
        sets: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value = "nft")]
        format: Format,
    },
    /// Report whether the applied ruleset is stale (exit code 1 if it is)
    Check {
        #[arg(short, long)]
        state: PathBuf,
        /// Snapshot store written by `run`
        #[arg(long)]
        snapshots: PathBuf,
        #[arg(long)]
        sets: Option<PathBuf>,
    },
    /// Reconcile on a timer until interrupted
    Run {
        #[arg(short, long)]
        state: PathBuf,
        /// Re-read on every interval; changes trigger a reconciliation
        #[arg(long)]
        sets: Option<PathBuf>,
        /// Controller config (default: XDG config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli.command, level)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(
    command: Commands,
    level: Level,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        Commands::Compile {
            state,
            sets,
            format,
        } => {
            init_stderr_logging(level);
            let state = FileSource::new(state).fetch().await?;
            let cache = load_cache(sets.as_deref()).await?;
            let output = Ruleset::build(&state.policies, &state.services, &state.firewall, &cache)?;
            for policy in &output.skipped {
                warn!("Policy {} failed validation and was left out", policy.key());
            }
            match format {
                Format::Nft => print!("{}", output.ruleset.to_nft_text()),
                Format::Json => println!("{}", serde_json::to_string_pretty(&output.applied)?),
            }
        }
        Commands::Check {
            state,
            snapshots,
            sets,
        } => {
            init_stderr_logging(level);
            let state = FileSource::new(state).fetch().await?;
            let cache = load_cache(sets.as_deref()).await?;
            let store = SnapshotStore::load(&snapshots).await?;
            if let Some(drift) = detect(&state.policies, &store, &cache) {
                println!("Stale: {drift}");
                return Ok(ExitCode::from(1));
            }
            println!("Up to date ({} policies, {} snapshots)", state.policies.len(), store.len());
        }
        Commands::Run {
            state,
            sets,
            config: config_path,
        } => {
            utils::ensure_dirs()?;
            let config_path = config_path.or_else(config::default_config_path);
            let config = match &config_path {
                Some(path) => config::load_config(path).await?,
                None => ControllerConfig::default().with_env(),
            };
            if let Some(dir) = config.state_dir() {
                tokio::fs::create_dir_all(&dir).await?;
            }
            init_file_logging(&config, level);
            run(config, state, sets).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn load_cache(path: Option<&Path>) -> nftpolicy::Result<FqdnCache> {
    match path {
        Some(path) => Ok(FqdnCache::from_entries(resolver::load_entries(path).await?)),
        None => Ok(FqdnCache::new()),
    }
}

async fn run(
    config: ControllerConfig,
    state: PathBuf,
    sets: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = Arc::new(load_cache(sets.as_deref()).await?);
    let applier = NftApplier::new(&config.nft_command, &config.ruleset_path, config.dry_run)?;

    let store = match config.snapshot_path() {
        Some(path) => SnapshotStore::load_or_empty(&path).await,
        None => SnapshotStore::new(),
    };
    let mut reconciler = Reconciler::new(FileSource::new(&state), applier, Arc::clone(&cache), store)
        .with_apply_timeout(config.apply_timeout());
    if let Some(path) = config.snapshot_path() {
        reconciler = reconciler.with_snapshot_path(path);
    }
    if let Some(path) = config.audit_path() {
        reconciler = reconciler.with_audit(AuditLog::new(path));
    }

    info!(
        "Reconciling {} every {}s (apply timeout {}s{})",
        state.display(),
        config.reconcile_interval_secs,
        config.apply_timeout_secs,
        if config.dry_run { ", dry run" } else { "" }
    );
    let scheduler = Scheduler::start(reconciler, config.interval());

    let reload = sets.map(|path| {
        let handle = scheduler.handle();
        let cache = Arc::clone(&cache);
        let period = config.interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match resolver::load_entries(&path).await {
                    Ok(entries) => {
                        cache.replace_all(entries);
                        handle.trigger();
                    }
                    Err(e) => warn!("Keeping previous resolutions, {} unreadable: {e}", path.display()),
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping scheduler");
    if let Some(reload) = reload {
        reload.abort();
    }
    drop(scheduler);
    Ok(())
}

fn init_stderr_logging(level: Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

/// Logs to `nftpolicy.log` in the state directory, falling back to stderr
fn init_file_logging(config: &ControllerConfig, level: Level) {
    if let Some(dir) = config.state_dir()
        && let Ok(file) = std::fs::File::create(dir.join("nftpolicy.log"))
    {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(file)
            .init();
        return;
    }
    init_stderr_logging(level);
}
