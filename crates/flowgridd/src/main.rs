//! flowgridd — the Flowgrid dispatch daemon.
//!
//! Single binary that assembles the engine:
//! - Execution store (redb)
//! - Dispatch criteria and execution router
//! - Queue processor and worker pool
//! - Stale execution reaper and aged container sweep
//! - REST API and Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! flowgridd run --config /etc/flowgrid/flowgrid.toml --data-dir /var/lib/flowgrid
//! ```

mod engine;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info};

use flowgrid_core::FlowgridConfig;
use flowgrid_dispatch::{HttpGateway, HttpOrchestrator};
use flowgrid_state::StateStore;

use crate::engine::Engine;

#[derive(Parser)]
#[command(name = "flowgridd", about = "Flowgrid containerized dispatch daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch engine and its API.
    Run {
        /// Path to flowgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory for the execution store; overrides `store.path`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// API listen address; overrides `api.listen`.
        #[arg(long)]
        api_listen: Option<String>,

        /// Debug logging for flowgrid crates.
        #[arg(long, short)]
        verbose: bool,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "info,flowgrid=debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            api_listen,
            verbose,
            log_format,
        } => {
            init_tracing(verbose, log_format);
            let mut config = match &config {
                Some(path) => FlowgridConfig::from_file(path)?,
                None => FlowgridConfig::default(),
            };
            if let Some(dir) = data_dir {
                std::fs::create_dir_all(&dir)?;
                config.store.path = dir.join("flowgrid.redb");
            }
            if let Some(listen) = api_listen {
                config.api.listen = listen;
            }
            run(config).await
        }
    }
}

async fn run(config: FlowgridConfig) -> anyhow::Result<()> {
    info!(
        cluster = %config.kubernetes.cluster_name,
        namespace = %config.kubernetes.namespace,
        "flowgrid daemon starting"
    );

    let store = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "execution store opened");

    let orchestrator = Arc::new(HttpOrchestrator::new(&config.kubernetes)?);
    let gateway = Arc::new(HttpGateway::new(config.kubernetes.clone()));
    let engine = Engine::build(&config, store, orchestrator, gateway)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.start(shutdown_rx).await;

    // ── Start API server ───────────────────────────────────────

    let router = flowgrid_api::build_router(engine.api_state());
    let listener = tokio::net::TcpListener::bind(&config.api.listen).await?;
    info!(addr = %config.api.listen, "API server starting");

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
    });
    let served = server.await;

    let _ = shutdown_tx.send(true);
    engine.shutdown().await;
    for handle in handles {
        let _ = handle.await;
    }

    served?;
    info!("flowgrid daemon stopped");
    Ok(())
}
