//! abacusd: Abacus contest-server replication daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use abacus_core::config::AbacusConfig;
use abacus_services::{
    apply_inbound, build_messenger, MemoryStore, MessageStore, PeerDirectory, PeerTable,
    ResendCoordinator,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = AbacusConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = AbacusConfig::load().context("failed to load config")?;
    tracing::info!(
        node = config.node.id,
        name = %config.node.name,
        transport = %config.messenger.kind,
        peers = config.peers.len(),
        "abacusd starting"
    );

    // ── Collaborators ────────────────────────────────────────────────────────
    let table = PeerTable::new(config.node.id, config.peers.clone());
    let directory: Arc<dyn PeerDirectory> = Arc::new(table);
    let memory = MemoryStore::new();
    let store: Arc<dyn MessageStore> = Arc::new(memory.clone());

    let messenger = build_messenger(&config, directory.clone(), store.clone())
        .context("failed to build messenger")?;
    messenger
        .initialise()
        .await
        .with_context(|| format!("failed to initialise {} messenger", messenger.name()))?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let mut inbound_task = tokio::spawn(apply_inbound(messenger.clone(), store.clone()));

    let (coordinator, resend) = ResendCoordinator::new(
        messenger.clone(),
        store.clone(),
        directory.clone(),
        &config.resend,
        shutdown_tx.subscribe(),
    );
    let resend_task = tokio::spawn(coordinator.run());

    // Flush whatever the store already holds for every peer.
    for node in directory.list_remote_nodes() {
        resend.wake(node);
    }

    let stats_printer = {
        let messenger = messenger.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                interval.tick().await;
                messenger.stats().log(messenger.name());
                tracing::info!(stored = memory.len(), "message store snapshot");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = &mut inbound_task    => tracing::error!("inbound loop exited: {:?}", r),
        r = resend_task          => tracing::error!("resend coordinator exited: {:?}", r),
        r = stats_printer        => tracing::error!("stats printer exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    messenger.shutdown().await;
    if !inbound_task.is_finished() {
        match tokio::time::timeout(Duration::from_secs(5), inbound_task).await {
            Ok(Ok(applied)) => tracing::info!(applied, "inbound loop drained"),
            Ok(Err(e)) => tracing::error!(error = %e, "inbound loop failed"),
            Err(_) => tracing::warn!("inbound loop did not drain in time"),
        }
    }
    drop(resend);

    Ok(())
}
