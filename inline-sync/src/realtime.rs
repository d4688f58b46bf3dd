//! Top-level wiring of the realtime engine.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::applicator::UpdateApplicator;
use crate::bucket::{BucketContext, BucketReport};
use crate::config::RealtimeConfig;
use crate::connection::{
    ConnectionHandle, ConnectionManager, ConnectionSnapshot, CredentialSource, SnapshotStream,
    Transition,
};
use crate::error::SyncResult;
use crate::router::UpdateRouter;
use crate::store::BucketStore;
use crate::transport::Transport;

/// A running engine: connection manager plus update router.
pub struct RealtimeHandle {
    connection: ConnectionHandle,
    reports: Option<mpsc::UnboundedReceiver<BucketReport>>,
    manager_task: JoinHandle<()>,
    router_task: JoinHandle<()>,
}

/// Spawns the connection manager and the update router on the current
/// runtime. Nothing connects until [`RealtimeHandle::start`].
pub fn create_realtime(
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    store: Arc<dyn BucketStore>,
    applicator: Arc<dyn UpdateApplicator>,
) -> RealtimeHandle {
    let ctx = BucketContext {
        config: config.sync,
        store,
        applicator,
    };
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let (router, router_tx) = UpdateRouter::new(ctx);
    let router_task = router.with_observer(reports_tx).spawn();

    let (manager, connection) =
        ConnectionManager::new(config.connection, transport, credentials, Some(router_tx));
    let manager_task = manager.spawn();

    RealtimeHandle {
        connection,
        reports: Some(reports_rx),
        manager_task,
        router_task,
    }
}

impl RealtimeHandle {
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn start(&self) -> SyncResult<()> {
        self.connection.start()
    }

    pub fn stop(&self) -> SyncResult<()> {
        self.connection.stop()
    }

    pub fn set_network_reachable(&self, reachable: bool) -> SyncResult<()> {
        self.connection.set_network_reachable(reachable)
    }

    pub fn app_backgrounded(&self) -> SyncResult<()> {
        self.connection.app_backgrounded()
    }

    pub fn app_foregrounded(&self) -> SyncResult<()> {
        self.connection.app_foregrounded()
    }

    pub fn probe_now(&self) -> SyncResult<()> {
        self.connection.probe_now()
    }

    pub fn subscribe(&self) -> SnapshotStream {
        self.connection.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.connection.transitions()
    }

    /// Takes the stream of bucket reports. Returns `None` after the first call.
    pub fn take_bucket_reports(&mut self) -> Option<mpsc::UnboundedReceiver<BucketReport>> {
        self.reports.take()
    }

    /// Closes the connection and waits for both actors to finish.
    pub async fn shutdown(self) -> SyncResult<()> {
        let result = self.connection.shutdown().await;
        if let Err(e) = self.manager_task.await {
            warn!("[CONN] manager task ended abnormally: {e}");
        }
        if let Err(e) = self.router_task.await {
            warn!("[ROUTER] router task ended abnormally: {e}");
        }
        result
    }
}
