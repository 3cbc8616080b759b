//! meshd - ensemble mesh coordination daemon.
//!
//! Wires the long-lived pieces together: configuration, the attested
//! key lifecycle, the session replay store, the in-process service
//! surface, and the ensemble formation coordinator. Runs until
//! interrupted; SIGTERM drains before shutting down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use meshd_daemon::attestation::{
    AttestationCache, BackoffPolicy, KeyLifecycleManager, SoftwareAttestor,
};
use meshd_daemon::config::DaemonConfig;
use meshd_daemon::coordinator::Coordinator;
use meshd_daemon::health;
use meshd_daemon::replay::SessionStore;
use meshd_daemon::service::DaemonService;
use meshd_daemon::transport::{InMemoryControlChannel, StaticFollowerClients, StubMeshBackend};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default time to live of a software-attested key.
const DEFAULT_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the aggregated health snapshot is logged.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// meshd - ensemble mesh coordination daemon
#[derive(Parser, Debug)]
#[command(name = "meshd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long, default_value = "meshd.toml")]
    config: PathBuf,

    /// Log filter (tracing `EnvFilter` syntax)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DaemonConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    let local_rank = config
        .local_rank()
        .context("local UDID missing from the ensemble table")?;
    info!(
        rank = local_rank,
        nodes = config.ensemble.node_count(),
        "meshd starting"
    );

    // Attested key lifecycle. The software attestor stands in until a
    // hardware attestation root is wired behind the Attestor trait.
    let cache = AttestationCache::new(&config.storage.attestation_cache);
    let (lifecycle, lifecycle_join) = KeyLifecycleManager::spawn(
        Arc::new(SoftwareAttestor::new(DEFAULT_KEY_TTL)),
        cache,
        [0u8; 32],
        config.timeouts.key_expiry_grace(),
        BackoffPolicy::default(),
    );

    // Session replay store, seeded with whatever keys the lifecycle
    // already restored from its cache.
    let initial_keys = lifecycle.key_set().map_or_else(Vec::new, |set| {
        set.valid_key_ids(std::time::SystemTime::now(), config.timeouts.key_expiry_grace())
    });
    let (store, blocked) = SessionStore::open(&config.storage.session_dir, &initial_keys)
        .context("opening session replay store")?;

    // The RPC layer that would consume the service surface is out of
    // scope here; the handle keeps the store-sync glue alive.
    let (_service, service_join) = DaemonService::start(
        lifecycle.clone(),
        Arc::new(store),
        blocked,
        config.timeouts.key_expiry_grace(),
    );

    // Formation coordinator. The control channel, mesh backend, and
    // follower client pool are seams; the in-process implementations
    // cover single-node operation, and an external transport drives
    // multi-node ensembles through CoordinatorHandle::inject.
    if !config.ensemble.is_single_node() {
        warn!("multi-node ensemble configured without an external control transport");
    }
    let (coordinator, coordinator_join) = Coordinator::spawn(
        config.ensemble.clone(),
        local_rank,
        config.timeouts.clone(),
        Arc::new(InMemoryControlChannel::new()),
        Arc::new(StubMeshBackend::new()),
        Arc::new(StaticFollowerClients::new()),
    );

    let formation = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.activate().await })
    };

    // Periodic health snapshot.
    let health_task = {
        let coordinator = coordinator.clone();
        let lifecycle = lifecycle.clone();
        let grace = config.timeouts.key_expiry_grace();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
            loop {
                ticker.tick().await;
                let set = lifecycle.key_set();
                let report = health::assess(coordinator.status(), set.as_ref(), grace);
                info!(
                    status = report.status.as_str(),
                    message = %report.message,
                    detail = report.detail.as_deref().unwrap_or(""),
                    "health"
                );
            }
        })
    };

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = formation => {
            match result {
                Ok(Ok(())) => info!("ensemble formation complete; serving"),
                Ok(Err(err)) => error!(%err, "ensemble formation failed"),
                Err(err) => error!(%err, "formation task panicked"),
            }
            // Keep serving the attestation and session surfaces either
            // way; wait for a shutdown signal.
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = sigterm.recv() => {
                    info!("SIGTERM received; draining");
                    coordinator.drain();
                },
            }
        },
        _ = tokio::signal::ctrl_c() => info!("interrupt received during formation"),
        _ = sigterm.recv() => {
            info!("SIGTERM received during formation; draining");
            coordinator.drain();
        },
    }

    info!("meshd shutting down");
    health_task.abort();
    coordinator.shutdown();
    lifecycle.shutdown();
    let _ = coordinator_join.await;
    let _ = lifecycle_join.await;
    service_join.abort();
    Ok(())
}
