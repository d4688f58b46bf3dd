//! Protocol session.
//!
//! A session lives for exactly one connection attempt. It opens the
//! transport, performs the handshake on request, correlates RPC answers with
//! their calls and hands everything else to the connection manager through a
//! single ordered channel. Reconnecting means building a new session.

mod pending;
mod rpc;

pub use pending::{PendingRpc, PendingTable, Resolution, RpcOutcome};
pub use rpc::RpcClient;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::error::{HandshakeError, SyncError, SyncResult};
use crate::generation::GenerationScope;
use crate::protocol::{
    ClientBody, ClientMessage, ConnectionErrorKind, MessageIdGenerator, PROTOCOL_LAYER,
    ServerBody, ServerPush,
};
use crate::transport::{Transport, TransportEvent, TransportEvents};
use inline_types::Update;

/// Typed event produced by a session, in transport arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport reported `opened`.
    TransportOpened,
    /// The server accepted the handshake.
    HandshakeAccepted,
    /// The server refused the handshake.
    HandshakeFailed(HandshakeError),
    /// A pushed batch of updates.
    Updates(Vec<Update>),
    /// Answer to a health ping.
    Pong(u64),
    /// The transport failed to open or closed.
    Closed(String),
}

/// A session event tagged with the generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEnvelope {
    pub generation: u64,
    pub event: SessionEvent,
}

pub(crate) struct SessionShared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) scope: GenerationScope,
    pub(crate) pending: PendingTable,
    pub(crate) rpc_timeout: Duration,
    ids: Mutex<MessageIdGenerator>,
    send_seq: AtomicU32,
}

impl SessionShared {
    pub(crate) fn next_id(&self) -> u64 {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_id()
    }

    /// Frames and sends one client message, returning its id.
    pub(crate) async fn send(&self, body: ClientBody) -> SyncResult<u64> {
        let id = self.next_id();
        self.send_as(id, body).await?;
        Ok(id)
    }

    /// Frames and sends one client message under a preassigned id.
    pub(crate) async fn send_as(&self, id: u64, body: ClientBody) -> SyncResult<()> {
        self.scope.check()?;
        let seq = self.send_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let frame = codec::encode_client(&ClientMessage { id, seq, body })?;
        self.transport.send(frame).await
    }
}

/// One connection attempt's protocol session.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, scope: GenerationScope, rpc_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                transport,
                scope,
                pending: PendingTable::new(),
                rpc_timeout,
                ids: Mutex::new(MessageIdGenerator::new()),
                send_seq: AtomicU32::new(0),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.shared.scope.generation()
    }

    pub fn scope(&self) -> &GenerationScope {
        &self.shared.scope
    }

    /// An RPC client bound to this session's generation.
    pub fn rpc(&self) -> RpcClient {
        RpcClient::new(self.shared.clone())
    }

    /// Number of RPCs awaiting an answer.
    pub fn pending_rpcs(&self) -> usize {
        self.shared.pending.len()
    }

    /// Sends the handshake. The answer arrives as a [`SessionEvent`].
    pub async fn send_connection_init(&self, token: &str, client_version: &str) -> SyncResult<()> {
        debug!(
            "[SESSION] gen {} sending connection init",
            self.generation()
        );
        self.shared
            .send(ClientBody::ConnectionInit {
                token: token.to_string(),
                layer: PROTOCOL_LAYER,
                client_version: client_version.to_string(),
            })
            .await
            .map(|_| ())
    }

    /// Sends a health ping. The pong arrives as a [`SessionEvent`].
    pub async fn send_ping(&self, nonce: u64) -> SyncResult<()> {
        trace!("[SESSION] gen {} ping {nonce}", self.generation());
        self.shared.send(ClientBody::Ping { nonce }).await.map(|_| ())
    }

    /// Opens the transport and pumps its events into `events` until the
    /// connection closes or the generation is cancelled.
    pub fn spawn(&self, events: mpsc::UnboundedSender<SessionEnvelope>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let generation = shared.scope.generation();
            let opened = shared.scope.run(shared.transport.open()).await;
            match opened {
                Ok(stream) => read_loop(shared, stream, events).await,
                Err(SyncError::Cancelled) => {
                    debug!("[SESSION] gen {generation} open cancelled");
                }
                Err(e) => {
                    let _ = events.send(SessionEnvelope {
                        generation,
                        event: SessionEvent::Closed(e.to_string()),
                    });
                }
            }
        })
    }

    /// Cancels the generation and fails every outstanding RPC.
    pub fn end(&self, reason: &str) {
        self.shared.scope.cancel();
        let failed = self.shared.pending.fail_all(reason);
        if failed > 0 {
            debug!(
                "[SESSION] gen {} ended with {failed} pending rpc(s): {reason}",
                self.generation()
            );
        }
    }
}

async fn read_loop(
    shared: Arc<SessionShared>,
    mut stream: TransportEvents,
    events: mpsc::UnboundedSender<SessionEnvelope>,
) {
    let generation = shared.scope.generation();
    let emit = |event: SessionEvent| {
        events
            .send(SessionEnvelope { generation, event })
            .is_ok()
    };

    loop {
        let next = tokio::select! {
            biased;
            () = shared.scope.cancelled() => {
                shared.pending.fail_all("session superseded");
                return;
            }
            next = stream.recv() => next,
        };

        let Some(event) = next else {
            shared.pending.fail_all("transport stream ended");
            emit(SessionEvent::Closed("transport stream ended".into()));
            return;
        };

        let keep_going = match event {
            TransportEvent::Opened => emit(SessionEvent::TransportOpened),
            TransportEvent::Closed(reason) => {
                shared.pending.fail_all(&reason);
                emit(SessionEvent::Closed(reason));
                return;
            }
            TransportEvent::Message(bytes) => match codec::decode_server(&bytes) {
                Ok(message) => match demux(&shared, message.body) {
                    Some(event) => emit(event),
                    None => true,
                },
                Err(e) => {
                    warn!("[SESSION] gen {generation} dropping undecodable frame: {e}");
                    true
                }
            },
        };
        if !keep_going {
            debug!("[SESSION] gen {generation} consumer gone, stopping reader");
            return;
        }
    }
}

/// Resolves RPC answers in place and returns every other frame as an event.
fn demux(shared: &SessionShared, body: ServerBody) -> Option<SessionEvent> {
    match body {
        ServerBody::ConnectionOpen => Some(SessionEvent::HandshakeAccepted),
        ServerBody::ConnectionError { kind, message } => {
            let error = match kind {
                ConnectionErrorKind::Unauthorized => HandshakeError::AuthRejected(message),
                ConnectionErrorKind::ProtocolMismatch => HandshakeError::ProtocolMismatch(message),
                ConnectionErrorKind::Other => HandshakeError::Closed(message),
            };
            Some(SessionEvent::HandshakeFailed(error))
        }
        ServerBody::RpcResult { req_msg_id, result } => {
            if !shared.pending.resolve(req_msg_id, Ok(result)) {
                debug!("[SESSION] late or unknown rpc result for {req_msg_id}");
            }
            None
        }
        ServerBody::RpcError {
            req_msg_id,
            error_code,
            message,
            code,
        } => {
            let error = SyncError::rpc(code, error_code, message);
            if !shared.pending.resolve(req_msg_id, Err(error)) {
                debug!("[SESSION] late or unknown rpc error for {req_msg_id}");
            }
            None
        }
        ServerBody::Message {
            push: ServerPush::Updates { updates },
        } => Some(SessionEvent::Updates(updates)),
        ServerBody::Pong { nonce } => Some(SessionEvent::Pong(nonce)),
    }
}
