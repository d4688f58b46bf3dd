//! Outstanding RPCs.
//!
//! A pending RPC is resolved at most once. The response path and the
//! timeout path both race for a three-state token; only the one whose
//! compare-and-swap moves it out of `PENDING` gets to act.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::error::{SyncError, SyncResult};
use crate::protocol::RpcResult;

const PENDING: u8 = 0;
const RESOLVED: u8 = 1;
const EXPIRED: u8 = 2;

/// Final outcome delivered to the caller.
pub type RpcOutcome = SyncResult<RpcResult>;

/// Resolution state of a pending RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    Resolved,
    Expired,
}

/// One in-flight RPC awaiting its answer.
pub struct PendingRpc {
    id: u64,
    method: &'static str,
    sent_at: Instant,
    timeout: Duration,
    state: AtomicU8,
    slot: Mutex<Option<oneshot::Sender<RpcOutcome>>>,
}

impl PendingRpc {
    /// Creates a pending RPC and the receiver its outcome will be sent on.
    pub fn new(
        id: u64,
        method: &'static str,
        timeout: Duration,
    ) -> (Arc<Self>, oneshot::Receiver<RpcOutcome>) {
        let (tx, rx) = oneshot::channel();
        let rpc = Arc::new(Self {
            id,
            method,
            sent_at: Instant::now(),
            timeout,
            state: AtomicU8::new(PENDING),
            slot: Mutex::new(Some(tx)),
        });
        (rpc, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn resolution(&self) -> Resolution {
        match self.state.load(Ordering::Acquire) {
            PENDING => Resolution::Pending,
            RESOLVED => Resolution::Resolved,
            _ => Resolution::Expired,
        }
    }

    /// Delivers a response. Returns `false` if the RPC was already settled.
    pub fn resolve(&self, outcome: RpcOutcome) -> bool {
        self.settle(RESOLVED, outcome)
    }

    /// Delivers a timeout. Returns `false` if the RPC was already settled.
    pub fn expire(&self) -> bool {
        self.settle(EXPIRED, Err(SyncError::RpcTimeout))
    }

    fn settle(&self, target: u8, outcome: RpcOutcome) -> bool {
        if self
            .state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The caller may have stopped waiting; that still counts as settled.
            let _ = sender.send(outcome);
        }
        true
    }
}

/// Table of in-flight RPCs for one session, keyed by message id.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<u64, Arc<PendingRpc>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<PendingRpc>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, rpc: Arc<PendingRpc>) {
        self.lock().insert(rpc.id(), rpc);
    }

    /// Resolves the RPC with `id`. Unknown or already-settled ids return `false`.
    pub fn resolve(&self, id: u64, outcome: RpcOutcome) -> bool {
        let rpc = self.lock().remove(&id);
        rpc.is_some_and(|rpc| rpc.resolve(outcome))
    }

    /// Times out the RPC with `id`. Unknown or already-settled ids return `false`.
    pub fn expire(&self, id: u64) -> bool {
        let rpc = self.lock().remove(&id);
        rpc.is_some_and(|rpc| rpc.expire())
    }

    /// Fails every outstanding RPC, e.g. when the session ends.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().drain().map(|(_, rpc)| rpc).collect();
        drained
            .into_iter()
            .filter(|rpc| rpc.resolve(Err(SyncError::Transport(reason.to_string()))))
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
