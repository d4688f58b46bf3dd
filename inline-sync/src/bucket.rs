//! Bucket sync worker.
//!
//! One worker task per bucket owns that bucket's cursor and serializes all
//! work on it: pushed updates, "has new updates" notices and `getUpdates`
//! catch-up. At most one fetch is in flight per bucket.
//!
//! While a fetch runs, pushed updates are buffered by seq instead of being
//! applied, and notices only mark the bucket for another fetch. When the
//! fetch finishes the buffer is drained in seq order against the cursor the
//! fetch persisted. The fetch itself filters duplicates against the range it
//! requested, which nothing else can move while it runs.

use futures::future::BoxFuture;
use inline_types::{Bucket, BucketCursor, UnixTime, Update};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::applicator::UpdateApplicator;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{GetUpdatesKind, GetUpdatesResult};
use crate::session::RpcClient;
use crate::store::BucketStore;

/// Collaborators shared by the router and every bucket worker.
#[derive(Clone)]
pub struct BucketContext {
    pub config: SyncConfig,
    pub store: Arc<dyn BucketStore>,
    pub applicator: Arc<dyn UpdateApplicator>,
}

/// What a worker tells its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketReport {
    /// Updates were applied; `max_date` is the newest of their dates.
    Applied { bucket: Bucket, max_date: UnixTime },
    /// The worker has nothing in flight and nothing buffered.
    Synced { bucket: Bucket, cursor: BucketCursor },
}

#[derive(Debug)]
enum WorkerInput {
    Push(Update),
    Notice { server_seq: u64 },
    Connected(RpcClient),
    Disconnected { generation: u64 },
}

/// Sender side of a bucket worker.
#[derive(Clone)]
pub struct BucketWorkerHandle {
    bucket: Bucket,
    tx: mpsc::UnboundedSender<WorkerInput>,
}

impl BucketWorkerHandle {
    pub fn bucket(&self) -> Bucket {
        self.bucket
    }

    fn send(&self, input: WorkerInput) -> SyncResult<()> {
        self.tx.send(input).map_err(|_| SyncError::ChannelClosed)
    }

    /// Delivers a pushed, sequenced update of this bucket.
    pub fn push(&self, update: Update) -> SyncResult<()> {
        self.send(WorkerInput::Push(update))
    }

    /// Reports that the server's seq for this bucket is `server_seq`.
    pub fn notify(&self, server_seq: u64) -> SyncResult<()> {
        self.send(WorkerInput::Notice { server_seq })
    }

    /// Hands the worker the RPC client of a newly opened connection.
    pub fn connected(&self, rpc: RpcClient) -> SyncResult<()> {
        self.send(WorkerInput::Connected(rpc))
    }

    pub fn disconnected(&self, generation: u64) -> SyncResult<()> {
        self.send(WorkerInput::Disconnected { generation })
    }
}

/// Starts the worker for `bucket`. It loads its cursor from the store first.
pub fn spawn_bucket_worker(
    bucket: Bucket,
    ctx: BucketContext,
    rpc: Option<RpcClient>,
    reports: mpsc::UnboundedSender<BucketReport>,
) -> (BucketWorkerHandle, JoinHandle<()>) {
    let (tx, inbox) = mpsc::unbounded_channel();
    let worker = BucketWorker {
        bucket,
        ctx,
        inbox,
        reports,
        cursor: BucketCursor::default(),
        rpc,
        buffer: BTreeMap::new(),
        fetch: None,
        refetch_requested: false,
        pending_fetch: false,
        immediate_refetches: 0,
        retry_at: None,
    };
    let task = tokio::spawn(worker.run());
    (BucketWorkerHandle { bucket, tx }, task)
}

struct FetchOutcome {
    cursor: BucketCursor,
    max_date: Option<UnixTime>,
    error: Option<SyncError>,
}

enum Wake {
    Input(WorkerInput),
    Fetched(FetchOutcome),
    Retry,
    Closed,
}

struct BucketWorker {
    bucket: Bucket,
    ctx: BucketContext,
    inbox: mpsc::UnboundedReceiver<WorkerInput>,
    reports: mpsc::UnboundedSender<BucketReport>,
    cursor: BucketCursor,
    rpc: Option<RpcClient>,
    /// Pushed updates waiting for their turn, by seq.
    buffer: BTreeMap<u64, Update>,
    fetch: Option<BoxFuture<'static, FetchOutcome>>,
    refetch_requested: bool,
    /// A fetch is owed once a connection is available.
    pending_fetch: bool,
    immediate_refetches: u32,
    retry_at: Option<Instant>,
}

impl BucketWorker {
    async fn run(mut self) {
        self.cursor = match self.ctx.store.load(self.bucket).await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => BucketCursor::default(),
            Err(e) => {
                error!("[BUCKET] {} failed to load cursor, starting from 0: {e}", self.bucket);
                BucketCursor::default()
            }
        };
        debug!("[BUCKET] {} worker started at seq {}", self.bucket, self.cursor.seq);

        loop {
            match self.next_wake().await {
                Wake::Input(input) => self.handle_input(input).await,
                Wake::Fetched(outcome) => self.on_fetched(outcome).await,
                Wake::Retry => {
                    self.retry_at = None;
                    self.request_fetch("retry");
                }
                Wake::Closed => break,
            }
        }
        debug!("[BUCKET] {} worker stopped", self.bucket);
    }

    async fn next_wake(&mut self) -> Wake {
        let retry_at = self
            .retry_at
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
        tokio::select! {
            input = self.inbox.recv() => input.map_or(Wake::Closed, Wake::Input),
            outcome = poll_fetch(&mut self.fetch), if self.fetch.is_some() => Wake::Fetched(outcome),
            () = sleep_until(retry_at), if self.retry_at.is_some() => Wake::Retry,
        }
    }

    async fn handle_input(&mut self, input: WorkerInput) {
        match input {
            WorkerInput::Push(update) => self.on_push(update).await,
            WorkerInput::Notice { server_seq } => self.on_notice(server_seq),
            WorkerInput::Connected(rpc) => {
                self.rpc = Some(rpc);
                if self.pending_fetch || !self.buffer.is_empty() {
                    self.request_fetch("reconnected");
                }
            }
            WorkerInput::Disconnected { generation } => {
                if self.rpc.as_ref().is_some_and(|rpc| rpc.generation() == generation) {
                    self.rpc = None;
                }
            }
        }
    }

    async fn on_push(&mut self, update: Update) {
        let Some(seq) = update.seq else {
            return;
        };
        if self.fetch.is_some() {
            debug!("[BUCKET] {} buffering seq {seq} during fetch", self.bucket);
            self.buffer.insert(seq, update);
            return;
        }
        if seq <= self.cursor.seq {
            debug!("[BUCKET] {} skipping duplicate seq {seq}", self.bucket);
            return;
        }
        self.buffer.insert(seq, update);
        self.drain_buffer().await;
        if !self.buffer.is_empty() {
            self.request_fetch("gap");
        } else {
            self.report_synced();
        }
    }

    fn on_notice(&mut self, server_seq: u64) {
        if self.fetch.is_some() {
            self.refetch_requested = true;
            return;
        }
        if server_seq <= self.cursor.seq && self.buffer.is_empty() {
            debug!(
                "[BUCKET] {} already at seq {} (server {server_seq})",
                self.bucket, self.cursor.seq
            );
            return;
        }
        self.request_fetch("notice");
    }

    fn request_fetch(&mut self, reason: &str) {
        if self.fetch.is_some() {
            self.refetch_requested = true;
            return;
        }
        let Some(rpc) = self.rpc.clone().filter(|rpc| !rpc.scope().is_cancelled()) else {
            debug!("[BUCKET] {} fetch deferred until connected ({reason})", self.bucket);
            self.pending_fetch = true;
            return;
        };
        self.pending_fetch = false;
        self.retry_at = None;
        debug!(
            "[BUCKET] {} fetching from seq {} ({reason})",
            self.bucket, self.cursor.seq
        );
        let fetch = Fetch {
            bucket: self.bucket,
            ctx: self.ctx.clone(),
            rpc,
            cursor: self.cursor,
            max_date: None,
            last_server: None,
        };
        self.fetch = Some(Box::pin(fetch.run()));
    }

    async fn on_fetched(&mut self, outcome: FetchOutcome) {
        self.fetch = None;
        if outcome.cursor.seq > self.cursor.seq {
            self.cursor = outcome.cursor;
        }
        if let Some(max_date) = outcome.max_date {
            self.report(BucketReport::Applied {
                bucket: self.bucket,
                max_date,
            });
        }

        match outcome.error {
            None => {}
            Some(SyncError::Cancelled) => {
                debug!("[BUCKET] {} fetch cancelled by disconnect", self.bucket);
                self.pending_fetch = true;
                self.refetch_requested = false;
                return;
            }
            Some(e) => {
                warn!("[BUCKET] {} fetch failed at seq {}: {e}", self.bucket, self.cursor.seq);
                self.refetch_requested = false;
                self.schedule_retry();
                return;
            }
        }

        self.drain_buffer().await;
        if !self.buffer.is_empty() {
            self.refetch_requested = true;
        }
        if !self.refetch_requested {
            self.immediate_refetches = 0;
            self.report_synced();
            return;
        }

        self.refetch_requested = false;
        if self.immediate_refetches < self.ctx.config.max_immediate_refetches {
            self.immediate_refetches += 1;
            self.request_fetch("refetch");
        } else {
            info!(
                "[BUCKET] {} refetched {} times in a row, pausing",
                self.bucket, self.immediate_refetches
            );
            self.immediate_refetches = 0;
            self.schedule_retry();
        }
    }

    /// Applies buffered updates that continue the cursor, dropping ones it
    /// already covers. Stops at the first gap.
    async fn drain_buffer(&mut self) {
        while let Some(entry) = self.buffer.first_entry() {
            let seq = *entry.key();
            if seq <= self.cursor.seq {
                entry.remove();
                continue;
            }
            if seq != self.cursor.seq + 1 {
                debug!(
                    "[BUCKET] {} gap between seq {} and buffered seq {seq}",
                    self.bucket, self.cursor.seq
                );
                break;
            }
            let update = entry.remove();
            if let Err(e) = self.ctx.applicator.apply_update(&update).await {
                warn!("[BUCKET] {} failed to apply seq {seq}: {e}", self.bucket);
                self.buffer.insert(seq, update);
                self.schedule_retry();
                break;
            }
            let date = update.date.unwrap_or(self.cursor.date);
            self.cursor = self.cursor.advanced(seq, date);
            if let Err(e) = self.ctx.store.save(self.bucket, self.cursor).await {
                warn!("[STORE] failed to save {} at seq {seq}: {e}", self.bucket);
            }
            if let Some(date) = update.date {
                self.report(BucketReport::Applied {
                    bucket: self.bucket,
                    max_date: date,
                });
            }
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry_at.is_none() {
            self.retry_at = Some(Instant::now() + self.ctx.config.refetch_delay());
        }
    }

    fn report_synced(&self) {
        if self.buffer.is_empty() && self.fetch.is_none() {
            self.report(BucketReport::Synced {
                bucket: self.bucket,
                cursor: self.cursor,
            });
        }
    }

    fn report(&self, report: BucketReport) {
        let _ = self.reports.send(report);
    }
}

async fn poll_fetch(fetch: &mut Option<BoxFuture<'static, FetchOutcome>>) -> FetchOutcome {
    match fetch {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

// ── Catch-up ─────────────────────────────────────────────────────

/// One catch-up run. Owns its copy of the cursor: nothing else advances
/// the bucket while it runs.
struct Fetch {
    bucket: Bucket,
    ctx: BucketContext,
    rpc: RpcClient,
    cursor: BucketCursor,
    max_date: Option<UnixTime>,
    last_server: Option<(u64, UnixTime)>,
}

impl Fetch {
    async fn run(mut self) -> FetchOutcome {
        let error = self.catch_up().await.err();
        FetchOutcome {
            cursor: self.cursor,
            max_date: self.max_date,
            error,
        }
    }

    async fn catch_up(&mut self) -> SyncResult<()> {
        let max_iterations = self.ctx.config.max_slice_iterations.max(1);
        let limit = self.ctx.config.get_updates_limit;
        let max_gap = self.ctx.config.max_total_gap;
        let first_seq = self.cursor.seq;
        let mut slice_end: Option<u64> = None;

        for _ in 0..max_iterations {
            self.rpc.scope().check()?;
            let start_seq = self.cursor.seq;
            let result = self
                .rpc
                .get_updates(self.bucket, start_seq, slice_end, limit)
                .await?;
            self.rpc.scope().check()?;
            self.last_server = Some((result.server_seq, result.server_date));

            match result.result_kind {
                GetUpdatesKind::TooLong => {
                    let gap = result.server_seq.saturating_sub(start_seq);
                    if gap > max_gap {
                        info!(
                            "[BUCKET] {} gap of {gap} exceeds {max_gap}, fast-forwarding",
                            self.bucket
                        );
                        return self.fast_forward(result.server_seq, result.server_date).await;
                    }
                    match result.seq_end {
                        Some(end) if end > start_seq && slice_end != Some(end) => {
                            debug!(
                                "[BUCKET] {} range too long, slicing {start_seq}..={end}",
                                self.bucket
                            );
                            slice_end = Some(end);
                        }
                        other => {
                            error!(
                                "[BUCKET] {} protocol violation: slice end {other:?} does not advance past seq {start_seq}",
                                self.bucket
                            );
                            return self.fast_forward(result.server_seq, result.server_date).await;
                        }
                    }
                }
                GetUpdatesKind::Normal => {
                    let done = self.apply_page(start_seq, slice_end, result).await?;
                    if let Some(end) = slice_end {
                        if self.cursor.seq >= end {
                            slice_end = None;
                        }
                    }
                    match done {
                        PageEnd::Finished => return Ok(()),
                        PageEnd::More => {}
                        PageEnd::Stalled => {
                            let (seq, date) = self.last_server.unwrap_or((start_seq, self.cursor.date));
                            return self.fast_forward(seq, date).await;
                        }
                    }
                }
            }
        }

        error!(
            "[BUCKET] {} still behind after {max_iterations} requests from seq {first_seq}, fast-forwarding",
            self.bucket
        );
        match self.last_server {
            Some((seq, date)) => self.fast_forward(seq, date).await,
            None => Ok(()),
        }
    }

    /// Applies one `normal` page and moves the cursor to its end.
    async fn apply_page(
        &mut self,
        start_seq: u64,
        slice_end: Option<u64>,
        result: GetUpdatesResult,
    ) -> SyncResult<PageEnd> {
        let upper = slice_end.unwrap_or(u64::MAX);
        let mut page: Vec<Update> = result
            .updates
            .into_iter()
            .filter(|update| update.seq.is_some_and(|seq| seq > start_seq && seq <= upper))
            .collect();
        page.sort_by_key(|update| update.seq);
        page.dedup_by_key(|update| update.seq);

        // Unsupported kinds still count toward the page's progress.
        let last_seq = page.last().and_then(|update| update.seq);
        let last_date = page.iter().filter_map(|update| update.date).max();
        let batch: Vec<Update> = page.into_iter().filter(Update::is_supported).collect();

        if !batch.is_empty() {
            self.ctx.applicator.apply_batch(&batch).await?;
            self.rpc.scope().check()?;
        }
        if let Some(date) = batch.iter().filter_map(|update| update.date).max() {
            self.max_date = Some(self.max_date.map_or(date, |max| max.max(date)));
        }

        let page_end = if result.is_final {
            match slice_end {
                Some(end) => end,
                None => result
                    .seq_end
                    .unwrap_or(result.server_seq)
                    .max(last_seq.unwrap_or(start_seq)),
            }
        } else {
            result.seq_end.or(last_seq).unwrap_or(start_seq)
        };

        if !result.is_final && page_end <= start_seq {
            error!(
                "[BUCKET] {} protocol violation: non-final page does not advance past seq {start_seq}",
                self.bucket
            );
            return Ok(PageEnd::Stalled);
        }

        let date = if Some(page_end) == last_seq {
            last_date
        } else if page_end >= result.server_seq {
            Some(result.server_date)
        } else {
            last_date
        };
        self.advance(page_end, date.unwrap_or(self.cursor.date)).await;

        if result.is_final {
            let more = slice_end.is_some() && self.cursor.seq < result.server_seq;
            Ok(if more { PageEnd::More } else { PageEnd::Finished })
        } else {
            Ok(PageEnd::More)
        }
    }

    async fn fast_forward(&mut self, seq: u64, date: UnixTime) -> SyncResult<()> {
        if seq <= self.cursor.seq {
            return Ok(());
        }
        warn!(
            "[BUCKET] {} fast-forward from seq {} to {seq}",
            self.bucket, self.cursor.seq
        );
        self.advance(seq, date).await;
        Ok(())
    }

    /// Moves the cursor forward and persists it. A failed save is logged;
    /// the next save carries the newer cursor anyway.
    async fn advance(&mut self, seq: u64, date: UnixTime) {
        let next = self.cursor.advanced(seq, date);
        if next == self.cursor {
            return;
        }
        self.cursor = next;
        if let Err(e) = self.ctx.store.save(self.bucket, next).await {
            warn!("[STORE] failed to save {} at seq {seq}: {e}", self.bucket);
        }
    }
}

enum PageEnd {
    Finished,
    More,
    Stalled,
}
