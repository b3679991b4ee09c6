use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use anyhow::Context;
use sandbox_exec::{Sandbox, SandboxPolicy, SystemdSandbox, UncontainedExec};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use server::artifacts::ArtifactStore;
use server::configuration::Configuration;
use server::events::EventBus;
use server::ingest::Ingest;
use server::store::Store;
use server::web::{self, AppState};
use server::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let config = Configuration::from_env();
    info!(db = ?config.results_db, uploads = ?config.upload_dir, "starting battleship arena");

    let store = Store::open(&config.results_db)?;
    let artifacts = ArtifactStore::new(config.upload_dir.clone(), config.engine_path.clone());
    artifacts.ensure_layout()?;

    let sandbox: Box<dyn Sandbox> = if config.allow_unsandboxed {
        warn!("running submissions WITHOUT resource isolation (BATTLESHIP_ALLOW_UNSANDBOXED)");
        Box::new(UncontainedExec)
    } else {
        Box::new(SystemdSandbox::new(SandboxPolicy::builder().build()?))
    };

    let bus = EventBus::new(256);
    let shutdown = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = mpsc::channel();

    let ingest = Arc::new(Ingest::new(store.clone(), artifacts.clone(), wake_tx));

    let worker = Worker::new(
        store.clone(),
        artifacts,
        sandbox,
        bus.clone(),
        shutdown.clone(),
    );
    let worker_thread = std::thread::Builder::new()
        .name("submission-worker".to_string())
        .spawn(move || worker.run(wake_rx))
        .context("spawning submission worker")?;

    let state = AppState {
        store,
        bus,
        ingest,
        admin_passcode: config.admin_passcode.clone(),
    };
    let app = web::router(state);

    let addr = format!("{}:{}", config.host, config.web_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, url = %config.external_url, "web API listening");
    info!(
        ssh_port = config.ssh_port,
        "uploads arrive through the external SSH transport"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Let the worker finish its current match, then wait for it.
    shutdown.store(true, Ordering::Relaxed);
    if worker_thread.join().is_err() {
        warn!("submission worker panicked during shutdown");
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("shutdown signal received");
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    Ok(())
}
