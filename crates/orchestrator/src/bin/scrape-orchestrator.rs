//! scrape-orchestrator: runs the civic scraper catalog.
//!
//! Subcommands:
//! - `list` prints the job catalog
//! - `run` runs one batch to completion and prints its summary as JSON
//! - `serve` runs the cadence loop, the resource monitor and the HTTP API
//!   until SIGINT/SIGTERM

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use civic_core::{Cadence, Category, OrchestratorConfig, SizeClass};
use civic_orchestrator::report::{router, spawn_http_server};
use civic_orchestrator::{BatchRequest, JobFilter, Orchestrator, SystemProbe};

// ── CLI ─────────────────────────────────────────────────────────────

/// Civic scraper orchestrator: bounded, scheduled, observable scraper runs.
#[derive(Parser, Debug)]
#[command(name = "scrape-orchestrator", version, about)]
struct Cli {
    /// Path to the orchestrator TOML config.
    #[arg(long, global = true, env = "CIVIC_CONFIG", default_value = "config/orchestrator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the job catalog.
    List {
        #[arg(long)]
        category: Option<Category>,
        #[arg(long)]
        size: Option<SizeClass>,
        #[arg(long)]
        cadence: Option<Cadence>,
    },
    /// Run one batch and print its summary.
    Run {
        #[arg(long)]
        category: Option<Category>,
        /// Job name; repeat for several.
        #[arg(long = "job")]
        jobs: Vec<String>,
        #[arg(long)]
        cadence: Option<Cadence>,
    },
    /// Serve the cadence loop and the HTTP API.
    Serve {
        /// Overrides `server.host`.
        #[arg(long)]
        host: Option<String>,
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    civic_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = OrchestratorConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    config.log_summary();

    let orchestrator = Arc::new(Orchestrator::from_config(config).context("failed to build job catalog")?);

    match cli.command {
        Command::List {
            category,
            size,
            cadence,
        } => {
            list(&orchestrator, JobFilter { category, size, cadence });
            Ok(())
        }
        Command::Run { category, jobs, cadence } => {
            let request = BatchRequest {
                category,
                jobs: if jobs.is_empty() { None } else { Some(jobs) },
                cadence,
            };
            run_once(orchestrator, request).await
        }
        Command::Serve { host, port } => serve(orchestrator, host, port).await,
    }
}

fn list(orchestrator: &Orchestrator, filter: JobFilter) {
    let jobs = orchestrator.list_jobs(&filter);
    let width = jobs.iter().map(|j| j.name.len()).max().unwrap_or(0);
    for job in &jobs {
        println!(
            "{:<width$}  {:<13}  {:<6}  {}",
            job.name,
            job.category.as_str(),
            job.size.as_str(),
            job.cadence,
            width = width
        );
    }
    info!(count = jobs.len(), "catalog listed");
}

async fn run_once(orchestrator: Arc<Orchestrator>, request: BatchRequest) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = orchestrator
        .monitor()
        .spawn(Box::new(SystemProbe::new()), shutdown_rx);

    let batch_id = orchestrator.run_batch(&request).context("batch rejected")?;
    info!(%batch_id, "batch started, Ctrl-C cancels queued jobs");

    let summary = tokio::select! {
        summary = orchestrator.wait_for_batch(batch_id) => summary?,
        _ = shutdown_signal() => {
            warn!(%batch_id, "interrupted, cancelling batch");
            orchestrator.cancel_batch(batch_id)?;
            orchestrator.wait_for_batch(batch_id).await?
        }
    };

    let _ = shutdown_tx.send(true);
    let _ = monitor.await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn serve(orchestrator: Arc<Orchestrator>, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let server = &orchestrator.config().server;
    let host = host.unwrap_or_else(|| server.host.clone());
    let port = port.unwrap_or(server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = orchestrator
        .spawn_background(shutdown_rx.clone())
        .context("failed to start background tasks")?;
    handles.push(spawn_http_server(addr, router(orchestrator.clone()), shutdown_rx));

    info!(%addr, "orchestrator serving");
    shutdown_signal().await;
    info!("shutdown signal received");

    let drained = orchestrator.shutdown().await;
    if !drained {
        warn!("some jobs were still running at shutdown");
    }
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    info!("orchestrator stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
