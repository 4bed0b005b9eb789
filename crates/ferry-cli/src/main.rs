//! Ferry gateway daemon
//!
//! Runs the transfer scheduler, and offers a few commands to inspect and run
//! transfers by hand.

mod config;
mod controller;
mod progress;

use clap::{Parser, Subcommand};
use ferry_core::model::unix_now;
use ferry_core::{MemoryStore, TransferLimits, TransferStatus, TransferStore};
use ferry_pipeline::{ClientPipeline, LocalClientFactory, PipelineRegistry, Protocols, Services};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use config::Config;
use controller::{Controller, run_pipeline};
use progress::{TransferProgress, format_bytes, format_duration, format_progress};

/// Ferry - managed file transfer gateway
#[derive(Parser)]
#[command(name = "ferryd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transfer scheduler until interrupted
    Daemon,

    /// Run a single client transfer in the foreground
    Run {
        /// Transfer identifier
        #[arg(required = true)]
        id: i64,
    },

    /// List live transfers and the history
    Status {
        /// Also list finished transfers
        #[arg(long)]
        history: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    // RUST_LOG wins over the command line and the configuration
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Daemon => run_daemon(&config).await?,
        Commands::Run { id } => run_transfer(id, &config).await?,
        Commands::Status { history } => show_status(history, &config)?,
    }

    Ok(())
}

/// Build the shared services described by the configuration
fn build_services(config: &Config) -> anyhow::Result<Services> {
    let store: Arc<dyn TransferStore> = Arc::new(MemoryStore::open(&config.store.path)?);
    let limits = &config.limits;

    Ok(Services::new(store)
        .with_paths(config.paths.clone())
        .with_limits(TransferLimits::new(limits.max_incoming, limits.max_outgoing))
        .with_registry(Arc::new(PipelineRegistry::with_limits(
            limits.max_server_transfers,
            limits.max_client_transfers,
        )))
        .with_protocols(Protocols::new().with(LocalClientFactory))
        .with_update_interval(config.controller.progress_update_interval()))
}

/// Run daemon mode
async fn run_daemon(config: &Config) -> anyhow::Result<()> {
    let controller = Controller::new(build_services(config)?);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        home = %config.paths.gateway_home.display(),
        "Starting Ferry daemon"
    );

    controller.recover(unix_now())?;

    let mut ticker = tokio::time::interval(config.controller.poll_interval());
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let scheduler = controller.clone();
                let pipelines = tokio::task::spawn_blocking(move || scheduler.tick(unix_now())).await?;
                for pipeline in pipelines {
                    workers.spawn_blocking(move || run_pipeline(&pipeline));
                }
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!("Transfer worker failed: {}", err);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    tracing::info!(running = workers.len(), "Shutting down");
    let stopper = controller.clone();
    let deadline = config.controller.handler_timeout();
    tokio::task::spawn_blocking(move || stopper.interrupt_all(deadline)).await?;

    let drained = tokio::time::timeout(config.controller.shutdown_timeout(), async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            running = workers.len(),
            "Some transfers did not stop in time"
        );
    }

    Ok(())
}

/// Run one client transfer with a progress bar
async fn run_transfer(id: i64, config: &Config) -> anyhow::Result<()> {
    let services = build_services(config)?;
    let trans = services.store.get_transfer(id)?;
    if trans.is_server() {
        anyhow::bail!("Transfer {id} was requested by a partner and cannot be run locally");
    }
    if trans.status == TransferStatus::Running {
        anyhow::bail!("Transfer {id} is already running");
    }

    let pipeline = Arc::new(ClientPipeline::new(&services, trans)?);
    let snapshot = pipeline.pipeline().context().snapshot();
    let name = snapshot
        .local_path
        .file_name()
        .map_or_else(|| snapshot.src_filename.clone(), |n| n.to_string_lossy().into_owned());

    println!("Transfer: {id}");
    println!("File: {}", snapshot.local_path.display());
    if let Some(size) = snapshot.filesize {
        println!("Size: {}", format_bytes(size));
    }

    let progress = TransferProgress::new(snapshot.filesize, &name);
    let worker = {
        let pipeline = Arc::clone(&pipeline);
        tokio::task::spawn_blocking(move || pipeline.run())
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(stream) = pipeline.pipeline().stream() {
                    progress.update(stream.progress());
                }
                if worker.is_finished() {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                let target = Arc::clone(pipeline.pipeline());
                let deadline = config.controller.handler_timeout();
                if let Err(err) = tokio::task::spawn_blocking(move || target.interrupt(deadline)).await? {
                    tracing::warn!(transfer_id = id, "Failed to notify the partner: {}", err);
                }
            }
        }
    }

    match worker.await? {
        Ok(()) => {
            progress.finish_with_message("Transfer complete!".to_string());
            Ok(())
        }
        Err(err) => {
            progress.abandon_with_message(format!("Transfer failed: {err}"));
            Err(err.into())
        }
    }
}

/// Show live transfers, and optionally the history
fn show_status(history: bool, config: &Config) -> anyhow::Result<()> {
    let store = MemoryStore::open(&config.store.path)?;

    println!("Ferry Status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Database: {}", config.store.path.display());
    println!();

    let mut transfers = store.list_transfers()?;
    transfers.sort_by_key(|t| t.id);
    println!("Transfers ({}):", transfers.len());
    for trans in &transfers {
        let rule = store.get_rule(trans.rule_id)?;
        println!(
            "  #{} {} {:<12} {:<10} {} [{}]",
            trans.id,
            if trans.is_server() { "server" } else { "client" },
            rule.name,
            trans.status,
            trans.src_filename,
            format_progress(trans.progress, trans.filesize)
        );
        if !trans.error.code.is_ok() {
            println!("      error: {} {}", trans.error.code, trans.error.details);
        }
        if let Some(at) = trans.next_retry {
            println!(
                "      retry in {} ({} tries left)",
                format_duration(Duration::from_secs(at.saturating_sub(unix_now()))),
                trans.remaining_tries
            );
        }
    }

    if history {
        let mut entries = store.list_history()?;
        entries.sort_by_key(|e| e.id);
        println!();
        println!("History ({}):", entries.len());
        for entry in &entries {
            println!(
                "  #{} {} {:<12} {:<10} {} [{}] in {}",
                entry.id,
                if entry.is_server { "server" } else { "client" },
                entry.rule,
                entry.status,
                entry.src_filename,
                format_progress(entry.progress, entry.filesize),
                format_duration(Duration::from_secs(entry.stop.saturating_sub(entry.start)))
            );
        }
    }

    Ok(())
}
