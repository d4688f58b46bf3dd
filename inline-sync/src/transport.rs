//! Transport layer abstraction.
//!
//! A transport is one ordered, bidirectional message channel with no retry
//! logic of its own. The connection manager owns it and calls `open` once per
//! connection attempt; the returned receiver yields events in arrival order.

use crate::error::SyncResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and ready to send.
    Opened,
    /// The connection ended. No further events follow.
    Closed(String),
    /// A complete inbound frame.
    Message(Vec<u8>),
}

/// Ordered stream of transport events for one connection.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A single-connection message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts a new connection, dropping any previous one.
    async fn open(&self) -> SyncResult<TransportEvents>;

    /// Sends one frame on the current connection.
    async fn send(&self, frame: Vec<u8>) -> SyncResult<()>;

    /// Closes the current connection. Closing an idle transport is a no-op.
    async fn close(&self) -> SyncResult<()>;
}

/// A scriptable in-memory transport for testing.
pub mod mock {
    use super::*;
    use crate::codec;
    use crate::error::SyncError;
    use crate::protocol::{ClientMessage, ServerMessage};
    use std::sync::{Arc, Mutex, PoisonError};

    type Responder = Box<dyn FnMut(&ClientMessage) -> Vec<ServerMessage> + Send>;

    #[derive(Default)]
    struct MockState {
        events_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
        sent_tx: Option<mpsc::UnboundedSender<ClientMessage>>,
        sent_log: Vec<ClientMessage>,
        responder: Option<Responder>,
        open_count: usize,
        close_count: usize,
        fail_opens: usize,
        hold_open: bool,
    }

    /// The client half: hand this to the connection manager.
    #[derive(Clone)]
    pub struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    /// The server half: the test drives the conversation through it.
    pub struct MockServer {
        state: Arc<Mutex<MockState>>,
        sent_rx: mpsc::UnboundedReceiver<ClientMessage>,
    }

    impl MockTransport {
        /// Creates a connected transport/server pair.
        pub fn pair() -> (Self, MockServer) {
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let state = Arc::new(Mutex::new(MockState {
                sent_tx: Some(sent_tx),
                ..MockState::default()
            }));
            (
                Self {
                    state: state.clone(),
                },
                MockServer { state, sent_rx },
            )
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(&self) -> SyncResult<TransportEvents> {
            let mut state = self.lock();
            state.open_count += 1;
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(SyncError::Transport("connection refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            if !state.hold_open {
                let _ = tx.send(TransportEvent::Opened);
            }
            state.events_tx = Some(tx);
            Ok(rx)
        }

        async fn send(&self, frame: Vec<u8>) -> SyncResult<()> {
            let message = codec::decode_client(&frame)?;
            let mut state = self.lock();
            let Some(events_tx) = state.events_tx.clone() else {
                return Err(SyncError::Transport("not connected".into()));
            };
            state.sent_log.push(message.clone());
            if let Some(sent_tx) = &state.sent_tx {
                let _ = sent_tx.send(message.clone());
            }
            let replies = match state.responder.as_mut() {
                Some(responder) => responder(&message),
                None => Vec::new(),
            };
            for reply in replies {
                let bytes = codec::encode_server(&reply)?;
                let _ = events_tx.send(TransportEvent::Message(bytes));
            }
            Ok(())
        }

        async fn close(&self) -> SyncResult<()> {
            let mut state = self.lock();
            if state.events_tx.take().is_some() {
                state.close_count += 1;
            }
            Ok(())
        }
    }

    impl MockServer {
        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Pushes a server message to the client, if connected.
        pub fn push(&self, message: ServerMessage) -> bool {
            let Ok(bytes) = codec::encode_server(&message) else {
                return false;
            };
            self.push_raw(bytes)
        }

        /// Pushes raw bytes to the client, if connected.
        pub fn push_raw(&self, bytes: Vec<u8>) -> bool {
            match &self.lock().events_tx {
                Some(tx) => tx.send(TransportEvent::Message(bytes)).is_ok(),
                None => false,
            }
        }

        /// Reports `opened` for a connection held with [`Self::hold_open`].
        pub fn complete_open(&self) -> bool {
            match &self.lock().events_tx {
                Some(tx) => tx.send(TransportEvent::Opened).is_ok(),
                None => false,
            }
        }

        /// Drops the connection from the server side.
        pub fn disconnect(&self, reason: &str) {
            let mut state = self.lock();
            if let Some(tx) = state.events_tx.take() {
                let _ = tx.send(TransportEvent::Closed(reason.to_string()));
            }
        }

        /// Makes the next `n` calls to `open` fail.
        pub fn fail_next_opens(&self, n: usize) {
            self.lock().fail_opens = n;
        }

        /// When set, `open` succeeds but `opened` is only reported by
        /// [`Self::complete_open`].
        pub fn hold_open(&self, hold: bool) {
            self.lock().hold_open = hold;
        }

        /// Installs a function that answers every client message.
        pub fn set_responder<F>(&self, responder: F)
        where
            F: FnMut(&ClientMessage) -> Vec<ServerMessage> + Send + 'static,
        {
            self.lock().responder = Some(Box::new(responder));
        }

        /// Waits for the next message the client sends.
        pub async fn next_sent(&mut self) -> Option<ClientMessage> {
            self.sent_rx.recv().await
        }

        /// Everything the client has sent so far.
        pub fn sent(&self) -> Vec<ClientMessage> {
            self.lock().sent_log.clone()
        }

        /// Whether a connection is currently open.
        pub fn is_connected(&self) -> bool {
            self.lock().events_tx.is_some()
        }

        /// How many times the client opened the transport.
        pub fn open_count(&self) -> usize {
            self.lock().open_count
        }

        /// How many times the client closed an open connection.
        pub fn close_count(&self) -> usize {
            self.lock().close_count
        }
    }
}
