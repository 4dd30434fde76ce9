// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ensemble daemon (`ensembled`).
//!
//! Serves the trajectory cache and job coordinator over HTTP. Settings come
//! from the platform config directory and can be overridden on the command
//! line.

mod api;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ensemble_app_core::config::ConfigService;
use ensemble_app_core::settings::ServiceSettings;
use ensemble_cache::DiskTier;
use ensemble_config_fs::FsConfigStore;
use ensemble_jobs::{Coordinator, ProcessExecutor, WorkspaceRoot};
use ensemble_query::QueryHandler;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ensemble trajectory cache daemon")]
struct Args {
    /// Directory holding `ensembled.json` (defaults to the platform config dir)
    #[arg(long)]
    config_dir: Option<PathBuf>,
    /// Interface to bind
    #[arg(long)]
    host: Option<String>,
    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,
    /// Root of the durable trajectory cache
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Root under which per-job workspaces are created
    #[arg(long)]
    workspace_root: Option<PathBuf>,
    /// Worker program run for every task
    #[arg(long)]
    worker: Option<PathBuf>,
    /// Delete the cache directory on shutdown
    #[arg(long)]
    remove_cache_on_exit: bool,
}

impl Args {
    fn apply(self, settings: &mut ServiceSettings) {
        if let Some(host) = self.host {
            settings.host = host;
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(dir) = self.cache_dir {
            settings.cache_dir = dir;
        }
        if let Some(dir) = self.workspace_root {
            settings.workspace_root = dir;
        }
        if let Some(program) = self.worker {
            settings.executor.program = program;
        }
        settings.remove_cache_on_exit |= self.remove_cache_on_exit;
    }
}

fn load_settings(args: Args) -> Result<ServiceSettings> {
    let store = match &args.config_dir {
        Some(dir) => FsConfigStore::at(dir),
        None => FsConfigStore::new(),
    }
    .context("open config store")?;
    info!(dir = %store.base().display(), "loading settings");
    let mut settings =
        ServiceSettings::load(&ConfigService::new(store)).context("load settings")?;
    args.apply(&mut settings);
    settings.validate().context("validate settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let settings = load_settings(args)?;

    let cache = DiskTier::open(&settings.cache_dir)
        .with_context(|| format!("open cache at {}", settings.cache_dir.display()))?;
    let report = cache.recover().context("recover cache")?;
    info!(?report, root = %settings.cache_dir.display(), "cache ready");

    let workspaces =
        WorkspaceRoot::open(&settings.workspace_root).context("open workspace root")?;
    let swept = workspaces.sweep().context("sweep workspaces")?;
    if swept > 0 {
        warn!(swept, "removed workspaces left by a previous run");
    }

    let executor = ProcessExecutor::new(settings.worker_command());
    let coordinator = Coordinator::new(
        Arc::new(cache),
        executor,
        workspaces,
        settings.coordinator_config(),
    );
    let app = api::router(QueryHandler::new(coordinator.clone()))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .with_context(|| format!("bind {}:{}", settings.host, settings.port))?;
    info!("ensembled listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!(active = coordinator.active_count(), "shutting down");
    coordinator.shutdown().await;
    if settings.remove_cache_on_exit {
        tokio::fs::remove_dir_all(&settings.cache_dir)
            .await
            .with_context(|| format!("remove cache at {}", settings.cache_dir.display()))?;
        info!(root = %settings.cache_dir.display(), "cache removed");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for ctrl-c; shutting down");
    }
}
