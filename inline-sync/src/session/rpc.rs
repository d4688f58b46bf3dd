use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::SessionShared;
use super::pending::PendingRpc;
use crate::error::{SyncError, SyncResult};
use crate::generation::GenerationScope;
use crate::protocol::{ClientBody, GetUpdatesResult, RpcCall, RpcResult};
use inline_types::{Bucket, UnixTime};

/// Issues RPCs on one session.
///
/// Clones share the session. Once its generation is cancelled every call
/// fails with [`SyncError::Cancelled`].
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("generation", &self.generation())
            .finish()
    }
}

impl RpcClient {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn generation(&self) -> u64 {
        self.shared.scope.generation()
    }

    pub fn scope(&self) -> &GenerationScope {
        &self.shared.scope
    }

    /// Sends `call` and waits for its answer with the session's default timeout.
    pub async fn call(&self, call: RpcCall) -> SyncResult<RpcResult> {
        self.call_with_timeout(call, self.shared.rpc_timeout).await
    }

    /// Sends `call` and waits at most `timeout` for its answer.
    pub async fn call_with_timeout(
        &self,
        call: RpcCall,
        timeout: Duration,
    ) -> SyncResult<RpcResult> {
        let shared = &self.shared;
        let method = call.method();
        let id = shared.next_id();

        // Registered before sending so an immediate reply finds its entry.
        let (pending, mut rx) = PendingRpc::new(id, method, timeout);
        shared.pending.insert(pending);
        if let Err(e) = shared.send_as(id, ClientBody::RpcCall { call }).await {
            shared.pending.resolve(id, Err(SyncError::NotConnected));
            return Err(e);
        }

        let outcome = tokio::select! {
            outcome = &mut rx => outcome.unwrap_or(Err(SyncError::ChannelClosed)),
            () = tokio::time::sleep(timeout) => {
                if !shared.pending.expire(id) {
                    debug!("[SESSION] {method} {id} answered while timing out");
                }
                rx.await.unwrap_or(Err(SyncError::RpcTimeout))
            }
            () = shared.scope.cancelled() => {
                shared.pending.resolve(id, Err(SyncError::Cancelled));
                rx.await.unwrap_or(Err(SyncError::Cancelled))
            }
        };
        // Calls failed by a teardown surface as cancellations.
        match outcome {
            Err(_) if shared.scope.is_cancelled() => Err(SyncError::Cancelled),
            other => other,
        }
    }

    /// Asks the server to push "has new updates" notices for buckets that
    /// changed since `date`.
    pub async fn get_updates_state(&self, date: UnixTime) -> SyncResult<UnixTime> {
        match self.call(RpcCall::GetUpdatesState { date }).await? {
            RpcResult::GetUpdatesState { date } => Ok(date),
            other => Err(unexpected("getUpdatesState", &other)),
        }
    }

    /// Fetches updates of `bucket` after `start_seq`, up to `seq_end` inclusive.
    pub async fn get_updates(
        &self,
        bucket: Bucket,
        start_seq: u64,
        seq_end: Option<u64>,
        limit: u32,
    ) -> SyncResult<GetUpdatesResult> {
        let call = RpcCall::GetUpdates {
            bucket,
            start_seq,
            seq_end,
            limit,
        };
        match self.call(call).await? {
            RpcResult::GetUpdates(result) => Ok(result),
            other => Err(unexpected("getUpdates", &other)),
        }
    }

    /// Sends a ping frame. Pongs are delivered as session events.
    pub async fn ping(&self, nonce: u64) -> SyncResult<()> {
        self.shared.send(ClientBody::Ping { nonce }).await.map(|_| ())
    }
}

fn unexpected(method: &str, result: &RpcResult) -> SyncError {
    let got = match result {
        RpcResult::GetUpdatesState { .. } => "getUpdatesState",
        RpcResult::GetUpdates(_) => "getUpdates",
    };
    SyncError::ProtocolViolation(format!("{method} answered with a {got} result"))
}
