//! WebSocket transport for the realtime endpoint.
//!
//! Each `open` spawns one task that owns the socket. The task connects,
//! forwards outbound frames and reports everything it reads as
//! [`TransportEvent`]s. Opening again aborts the previous task; closing
//! ends it, abandoning a connect that has not finished yet.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use inline_sync::transport::TransportEvents;
use inline_sync::{SyncError, SyncResult, Transport, TransportEvent};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// [`Transport`] over a single WebSocket connection at a time.
pub struct WebSocketTransport {
    url: Url,
    current: Mutex<Option<Connection>>,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            current: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.lock().take() {
            connection.task.abort();
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> SyncResult<TransportEvents> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(self.url.clone(), outbound_rx, events_tx));

        let previous = self.lock().replace(Connection {
            outbound: outbound_tx,
            task,
        });
        if let Some(previous) = previous {
            debug!("[WS] replacing previous connection");
            previous.task.abort();
        }
        Ok(events_rx)
    }

    async fn send(&self, frame: Vec<u8>) -> SyncResult<()> {
        // The server speaks JSON text frames.
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        let guard = self.lock();
        let Some(connection) = guard.as_ref() else {
            return Err(SyncError::Transport("not connected".into()));
        };
        connection
            .outbound
            .send(message)
            .map_err(|_| SyncError::Transport("connection closed".into()))
    }

    async fn close(&self) -> SyncResult<()> {
        if let Some(connection) = self.lock().take() {
            // The socket task sends the close frame, or drops a connect still
            // in progress, and exits.
            let _ = connection.outbound.send(Message::Close(None));
        }
        Ok(())
    }
}

async fn run_connection(
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let connect = connect_async(url.as_str());
    tokio::pin!(connect);
    let mut queued = Vec::new();
    let stream = loop {
        tokio::select! {
            biased;
            outgoing = outbound.recv() => match outgoing {
                Some(Message::Close(_)) | None => {
                    debug!("[WS] connect to {url} abandoned");
                    let _ = events.send(TransportEvent::Closed("closed by client".to_string()));
                    return;
                }
                Some(message) => queued.push(message),
            },
            connected = &mut connect => match connected {
                Ok((stream, _response)) => break stream,
                Err(e) => {
                    warn!("[WS] connect to {url} failed: {e}");
                    let _ = events.send(TransportEvent::Closed(e.to_string()));
                    return;
                }
            },
        }
    };
    debug!("[WS] connected to {url}");
    let _ = events.send(TransportEvent::Opened);

    let (mut sink, mut source) = stream.split();
    for message in queued {
        if let Err(e) = sink.send(message).await {
            let _ = events.send(TransportEvent::Closed(e.to_string()));
            return;
        }
    }
    let reason = loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        break e.to_string();
                    }
                    if closing {
                        break "closed by client".to_string();
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break "closed by client".to_string();
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Message(text.into_bytes())).is_err() {
                        break "event receiver dropped".to_string();
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if events.send(TransportEvent::Message(data)).is_err() {
                        break "event receiver dropped".to_string();
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                // Control frames are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            },
        }
    };

    debug!("[WS] connection to {url} ended: {reason}");
    let _ = events.send(TransportEvent::Closed(reason));
}
