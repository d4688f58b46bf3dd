//! Connection state, snapshots and snapshot fan-out.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Number of transitions kept for diagnostics.
pub const TRANSITION_LOG_CAPACITY: usize = 64;

/// Why the manager is not trying to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `start` has not been called yet.
    NotStarted,
    /// `stop` was called.
    Stopped,
    /// The network path is unreachable.
    NetworkUnreachable,
    /// There is no token to connect with.
    MissingCredentials,
}

/// Lifecycle state of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected(DisconnectReason),
    Connecting,
    Handshaking,
    Open,
    /// Waiting to retry. `attempt` counts consecutive failures.
    Backoff { until: Instant, attempt: u32 },
    /// The app stayed in background past the grace period.
    BackgroundSuspended,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether a connection attempt or session is live.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Handshaking | Self::Open)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected(_) => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Open => "open",
            Self::Backoff { .. } => "backoff",
            Self::BackgroundSuspended => "background_suspended",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(reason) => write!(f, "disconnected({reason:?})"),
            Self::Backoff { until, attempt } => {
                let wait = until.saturating_duration_since(Instant::now());
                write!(f, "backoff(attempt {attempt}, {}ms)", wait.as_millis())
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Immutable view of the connection, published on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    /// Consecutive failed attempts; reset once a connection opens.
    pub attempt_number: u32,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub changed_at: DateTime<Utc>,
}

impl ConnectionSnapshot {
    pub fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected(DisconnectReason::NotStarted),
            attempt_number: 0,
            last_error: None,
            connected_since: None,
            changed_at: Utc::now(),
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub attempt_number: u32,
    pub at: DateTime<Utc>,
}

/// A subscriber's private snapshot queue.
///
/// Dropping the stream unsubscribes.
pub struct SnapshotStream {
    rx: mpsc::UnboundedReceiver<ConnectionSnapshot>,
}

impl SnapshotStream {
    /// Waits for the next snapshot. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<ConnectionSnapshot> {
        self.rx.recv().await
    }

    /// Returns a queued snapshot without waiting.
    pub fn try_recv(&mut self) -> Option<ConnectionSnapshot> {
        self.rx.try_recv().ok()
    }

    /// Discards everything queued and returns the newest snapshot, if any.
    pub fn latest(&mut self) -> Option<ConnectionSnapshot> {
        let mut latest = None;
        while let Ok(snapshot) = self.rx.try_recv() {
            latest = Some(snapshot);
        }
        latest
    }
}

struct HubInner {
    current: ConnectionSnapshot,
    subscribers: Vec<mpsc::UnboundedSender<ConnectionSnapshot>>,
    transitions: VecDeque<Transition>,
}

/// Fans snapshots out to any number of independent subscribers.
///
/// Each subscriber owns an unbounded queue, so a slow reader only delays
/// itself. Only the connection manager publishes.
#[derive(Clone)]
pub struct SnapshotHub {
    inner: Arc<Mutex<HubInner>>,
}

impl Default for SnapshotHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                current: ConnectionSnapshot::initial(),
                subscribers: Vec::new(),
                transitions: VecDeque::with_capacity(TRANSITION_LOG_CAPACITY),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber. The current snapshot is queued immediately.
    pub fn subscribe(&self) -> SnapshotStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let _ = tx.send(inner.current.clone());
        inner.subscribers.push(tx);
        SnapshotStream { rx }
    }

    pub fn current(&self) -> ConnectionSnapshot {
        self.lock().current.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    /// Most recent transitions, oldest first.
    pub fn transitions(&self) -> Vec<Transition> {
        self.lock().transitions.iter().cloned().collect()
    }

    /// Publishes `snapshot` to every live subscriber.
    pub fn publish(&self, snapshot: ConnectionSnapshot) {
        let mut inner = self.lock();
        if inner.current.state != snapshot.state {
            if inner.transitions.len() == TRANSITION_LOG_CAPACITY {
                inner.transitions.pop_front();
            }
            let transition = Transition {
                from: inner.current.state,
                to: snapshot.state,
                attempt_number: snapshot.attempt_number,
                at: snapshot.changed_at,
            };
            inner.transitions.push_back(transition);
        }
        inner.subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        inner.current = snapshot;
    }
}
