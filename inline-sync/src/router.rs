//! Update router actor.
//!
//! Receives connection changes and pushed update batches from the
//! connection manager, in arrival order, and:
//! - applies unsequenced updates right away
//! - hands sequenced updates to their bucket's worker
//! - turns "has new updates" notices into catch-up requests
//! - probes `getUpdatesState` on every new connection
//! - keeps the global `lastSyncDate` moving forward

use inline_types::{Bucket, UnixTime, Update};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bucket::{BucketContext, BucketReport, BucketWorkerHandle, spawn_bucket_worker};
use crate::error::SyncError;
use crate::session::RpcClient;

/// Input from the connection manager.
#[derive(Debug)]
pub enum RouterInput {
    /// A connection finished its handshake.
    Connected { rpc: RpcClient },
    /// The connection of `generation` is gone.
    Disconnected { generation: u64 },
    /// A pushed batch from the connection of `generation`.
    Updates { generation: u64, updates: Vec<Update> },
}

enum ProbeResult {
    Done { generation: u64 },
    Rejected { generation: u64, error: SyncError },
}

enum Wake {
    Input(RouterInput),
    Report(BucketReport),
    Probe(ProbeResult),
    Closed,
}

/// The update router actor.
pub struct UpdateRouter {
    ctx: BucketContext,
    inbox: mpsc::UnboundedReceiver<RouterInput>,
    reports_tx: mpsc::UnboundedSender<BucketReport>,
    reports_rx: mpsc::UnboundedReceiver<BucketReport>,
    probe_tx: mpsc::UnboundedSender<ProbeResult>,
    probe_rx: mpsc::UnboundedReceiver<ProbeResult>,
    observer: Option<mpsc::UnboundedSender<BucketReport>>,
    workers: HashMap<Bucket, (BucketWorkerHandle, JoinHandle<()>)>,
    rpc: Option<RpcClient>,
    last_sync_date: Option<UnixTime>,
    probe_resent: bool,
}

impl UpdateRouter {
    /// Builds a router and the sender the connection manager feeds it through.
    pub fn new(ctx: BucketContext) -> (Self, mpsc::UnboundedSender<RouterInput>) {
        let (input_tx, inbox) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        let router = Self {
            ctx,
            inbox,
            reports_tx,
            reports_rx,
            probe_tx,
            probe_rx,
            observer: None,
            workers: HashMap::new(),
            rpc: None,
            last_sync_date: None,
            probe_resent: false,
        };
        (router, input_tx)
    }

    /// Forwards every worker report to `observer` as well.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<BucketReport>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the input sender is dropped.
    pub async fn run(mut self) {
        self.last_sync_date = match self.ctx.store.load_global_last_sync_date().await {
            Ok(date) => date,
            Err(e) => {
                warn!("[ROUTER] failed to load lastSyncDate: {e}");
                None
            }
        };
        info!("[ROUTER] started, lastSyncDate {:?}", self.last_sync_date);

        loop {
            let wake = tokio::select! {
                input = self.inbox.recv() => input.map_or(Wake::Closed, Wake::Input),
                Some(report) = self.reports_rx.recv() => Wake::Report(report),
                Some(probe) = self.probe_rx.recv() => Wake::Probe(probe),
            };
            match wake {
                Wake::Input(input) => self.handle_input(input).await,
                Wake::Report(report) => self.handle_report(report).await,
                Wake::Probe(probe) => self.handle_probe(probe).await,
                Wake::Closed => break,
            }
        }

        for (_, (handle, task)) in self.workers.drain() {
            drop(handle);
            let _ = task.await;
        }
        info!("[ROUTER] stopped");
    }

    async fn handle_input(&mut self, input: RouterInput) {
        match input {
            RouterInput::Connected { rpc } => self.on_connected(rpc).await,
            RouterInput::Disconnected { generation } => {
                if self.current_generation() != Some(generation) {
                    return;
                }
                debug!("[ROUTER] generation {generation} disconnected");
                self.rpc = None;
                for (handle, _) in self.workers.values() {
                    let _ = handle.disconnected(generation);
                }
            }
            RouterInput::Updates {
                generation,
                updates,
            } => {
                if self.current_generation() != Some(generation) {
                    debug!(
                        "[ROUTER] dropping {} update(s) from stale generation {generation}",
                        updates.len()
                    );
                    return;
                }
                self.route(updates).await;
            }
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.rpc.as_ref().map(RpcClient::generation)
    }

    async fn on_connected(&mut self, rpc: RpcClient) {
        info!("[ROUTER] connected (generation {})", rpc.generation());
        self.rpc = Some(rpc.clone());
        self.probe_resent = false;
        for (handle, _) in self.workers.values() {
            let _ = handle.connected(rpc.clone());
        }

        let date = self.trusted_last_sync_date().await;
        self.spawn_probe(rpc, date);
    }

    /// The persisted `lastSyncDate`, or a fresh one when it is missing or stale.
    async fn trusted_last_sync_date(&mut self) -> UnixTime {
        let now = UnixTime::now();
        match self.last_sync_date {
            Some(date) if !date.is_older_than(self.ctx.config.max_sync_staleness(), now) => date,
            stale => {
                info!("[ROUTER] lastSyncDate {stale:?} missing or stale, resetting");
                self.reset_last_sync_date(now).await
            }
        }
    }

    async fn reset_last_sync_date(&mut self, now: UnixTime) -> UnixTime {
        let date = now.saturating_sub(self.ctx.config.last_sync_safety_gap());
        self.last_sync_date = Some(date);
        if let Err(e) = self.ctx.store.save_global_last_sync_date(date).await {
            warn!("[STORE] failed to save lastSyncDate: {e}");
        }
        date
    }

    fn spawn_probe(&self, rpc: RpcClient, date: UnixTime) {
        let results = self.probe_tx.clone();
        tokio::spawn(async move {
            let generation = rpc.generation();
            debug!("[ROUTER] getUpdatesState since {date}");
            let outcome = rpc.get_updates_state(date).await;
            let result = match outcome {
                Ok(_) => ProbeResult::Done { generation },
                Err(SyncError::Cancelled) => return,
                Err(error) => ProbeResult::Rejected { generation, error },
            };
            let _ = results.send(result);
        });
    }

    async fn handle_probe(&mut self, probe: ProbeResult) {
        match probe {
            ProbeResult::Done { generation } => {
                debug!("[ROUTER] state probe for generation {generation} acknowledged");
            }
            ProbeResult::Rejected { generation, error } => {
                if self.current_generation() != Some(generation) {
                    return;
                }
                let Some(rpc) = self.rpc.clone() else {
                    return;
                };
                if self.probe_resent {
                    error!("[ROUTER] state probe failed again: {error}");
                    return;
                }
                warn!("[ROUTER] state probe failed ({error}), resetting lastSyncDate and resending");
                self.probe_resent = true;
                let date = self.reset_last_sync_date(UnixTime::now()).await;
                self.spawn_probe(rpc, date);
            }
        }
    }

    async fn route(&mut self, updates: Vec<Update>) {
        let mut max_date: Option<UnixTime> = None;
        for update in updates {
            if let Some((bucket, server_seq)) = update.bucket_notice() {
                debug!("[ROUTER] {bucket} has new updates up to seq {server_seq}");
                let _ = self.worker(bucket).notify(server_seq);
                continue;
            }
            if !update.is_supported() {
                debug!("[ROUTER] ignoring unsupported update");
                continue;
            }
            match (update.seq, update.bucket()) {
                (Some(_), Some(bucket)) => {
                    let _ = self.worker(bucket).push(update);
                }
                _ => match self.ctx.applicator.apply_update(&update).await {
                    Ok(()) => {
                        if let Some(date) = update.date {
                            max_date = Some(max_date.map_or(date, |max| max.max(date)));
                        }
                    }
                    Err(e) => warn!("[ROUTER] failed to apply {}: {e}", update.kind_name()),
                },
            }
        }
        if let Some(date) = max_date {
            self.advance_last_sync_date(date).await;
        }
    }

    fn worker(&mut self, bucket: Bucket) -> &BucketWorkerHandle {
        let (handle, _) = self.workers.entry(bucket).or_insert_with(|| {
            debug!("[ROUTER] starting worker for {bucket}");
            spawn_bucket_worker(
                bucket,
                self.ctx.clone(),
                self.rpc.clone(),
                self.reports_tx.clone(),
            )
        });
        handle
    }

    async fn handle_report(&mut self, report: BucketReport) {
        if let BucketReport::Applied { max_date, .. } = &report {
            self.advance_last_sync_date(*max_date).await;
        }
        if let Some(observer) = &self.observer {
            let _ = observer.send(report);
        }
    }

    /// Moves `lastSyncDate` to `max_date - safety gap` unless that would move
    /// it backwards. A failed save leaves the cached value untouched so the
    /// next applied batch retries it.
    async fn advance_last_sync_date(&mut self, max_date: UnixTime) {
        let candidate = max_date.saturating_sub(self.ctx.config.last_sync_safety_gap());
        if self.last_sync_date.is_some_and(|current| candidate <= current) {
            return;
        }
        match self.ctx.store.save_global_last_sync_date(candidate).await {
            Ok(()) => {
                debug!("[ROUTER] lastSyncDate -> {candidate}");
                self.last_sync_date = Some(candidate);
            }
            Err(e) => warn!("[STORE] failed to save lastSyncDate: {e}"),
        }
    }
}
