use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::engine::VersionedStateStore;
use crate::startup::{remove_pid_file, write_pid_file, DaemonPaths};
use crate::store::recovery::StartupRecoveryReport;
use crate::store::PersistenceStore;
use crate::sync::SyncCoordinator;
use crate::transport::ws::serve;

pub struct DaemonHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
    local_addr: SocketAddr,
    coordinator: Arc<SyncCoordinator>,
    recovery: StartupRecoveryReport,
}

impl DaemonHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<VersionedStateStore> {
        self.coordinator.store()
    }

    pub fn recovery_report(&self) -> &StartupRecoveryReport {
        &self.recovery
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shut down and wait until persistence is flushed.
    pub async fn wait(mut self) -> Result<()> {
        self.shutdown();
        match self.task.take() {
            Some(task) => task.await.map_err(|error| anyhow!("daemon task panicked: {error}"))?,
            None => Ok(()),
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run until Ctrl-C.
pub async fn run_standalone(config: DaemonConfig, paths: DaemonPaths) -> Result<()> {
    let handle = start(config, paths).await?;
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    handle.wait().await
}

/// Open persistence, recover state, and start serving.
pub async fn start(config: DaemonConfig, paths: DaemonPaths) -> Result<DaemonHandle> {
    let persistence = Arc::new(
        PersistenceStore::open(&paths.db_path)
            .with_context(|| format!("failed to open `{}`", paths.db_path.display()))?,
    );
    let (store, recovery) =
        VersionedStateStore::recover(Arc::clone(&persistence), config.snapshot.policy())?;
    if !recovery.degraded_workspaces.is_empty() {
        warn!(degraded = ?recovery.degraded_workspaces, "some workspaces recovered partially");
    }
    let store = Arc::new(store);
    let coordinator = SyncCoordinator::new(Arc::clone(&store), config.sync.gap_threshold);

    let bind_addr = config.server.bind_addr().context("invalid server.bind")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr().context("failed to read bound address")?;
    write_pid_file(&paths.pid_path)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let vacuum = spawn_vacuum_task(Arc::clone(&store), &config, shutdown_rx.clone());
    let server_coordinator = Arc::clone(&coordinator);
    let pid_path = paths.pid_path.clone();
    let task = tokio::spawn(async move {
        let served = serve(listener, server_coordinator, shutdown_rx).await;
        if let Err(error) = vacuum.await {
            warn!(?error, "vacuum task ended abnormally");
        }
        let flushed = persistence.flush();
        remove_pid_file(&pid_path);
        info!("daemon stopped");
        served.and(flushed)
    });

    info!(addr = %local_addr, db = %paths.db_path.display(), "slotsync daemon started");
    Ok(DaemonHandle { shutdown_tx, task: Some(task), local_addr, coordinator, recovery })
}

fn spawn_vacuum_task(
    store: Arc<VersionedStateStore>,
    config: &DaemonConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = config.vacuum.interval();
    let policy = config.vacuum.policy();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; skip it so startup is not slowed.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let store = Arc::clone(&store);
                    match tokio::task::spawn_blocking(move || store.vacuum(&policy)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(error)) => warn!(error = %error, "vacuum failed"),
                        Err(error) => warn!(?error, "vacuum task panicked"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
