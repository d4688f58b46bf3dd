//! Connection manager actor.
//!
//! The manager is the only owner of the transport, the current session and
//! the connection state. Lifecycle inputs, session events, credential
//! changes and timers are all handled on one task, one at a time.
//!
//! At most one timer is armed: the connect or handshake deadline while
//! connecting, the ping tick while open, the reconnect deadline in backoff.
//! The background grace deadline is tracked separately because it runs
//! alongside every other state.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::credentials::CredentialSource;
use super::state::{
    ConnectionSnapshot, ConnectionState, DisconnectReason, SnapshotHub, SnapshotStream, Transition,
};
use crate::config::ConnectionConfig;
use crate::error::{HandshakeError, SyncError, SyncResult};
use crate::generation::GenerationScope;
use crate::router::RouterInput;
use crate::session::{Session, SessionEnvelope, SessionEvent};
use crate::transport::Transport;

/// Commands accepted by the manager.
#[derive(Debug)]
enum ConnectionCommand {
    Start,
    Stop,
    SetNetworkReachable(bool),
    AppBackgrounded,
    AppForegrounded,
    ProbeNow,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ConnectTimeout,
    HandshakeTimeout,
    Ping,
    Reconnect,
}

enum Wakeup {
    Command(Option<ConnectionCommand>),
    Session(SessionEnvelope),
    Credentials(Option<Option<String>>),
    Timer(TimerKind),
    BackgroundGraceElapsed,
}

/// Cloneable handle to a running connection manager.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    hub: SnapshotHub,
}

impl ConnectionHandle {
    fn send(&self, command: ConnectionCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::ChannelClosed)
    }

    /// Allows the manager to connect.
    pub fn start(&self) -> SyncResult<()> {
        self.send(ConnectionCommand::Start)
    }

    /// Closes the connection and stays disconnected until `start`.
    pub fn stop(&self) -> SyncResult<()> {
        self.send(ConnectionCommand::Stop)
    }

    /// Reports a network path change.
    pub fn set_network_reachable(&self, reachable: bool) -> SyncResult<()> {
        self.send(ConnectionCommand::SetNetworkReachable(reachable))
    }

    pub fn app_backgrounded(&self) -> SyncResult<()> {
        self.send(ConnectionCommand::AppBackgrounded)
    }

    pub fn app_foregrounded(&self) -> SyncResult<()> {
        self.send(ConnectionCommand::AppForegrounded)
    }

    /// Skips the rest of the current backoff delay, once per backoff window.
    pub fn probe_now(&self) -> SyncResult<()> {
        self.send(ConnectionCommand::ProbeNow)
    }

    /// Subscribes to connection snapshots, starting with the current one.
    pub fn subscribe(&self) -> SnapshotStream {
        self.hub.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.hub.current()
    }

    /// Recent state transitions, oldest first.
    pub fn transitions(&self) -> Vec<Transition> {
        self.hub.transitions()
    }

    /// Stops the manager task, closing any live connection.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionCommand::Shutdown(tx))?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }
}

/// The connection manager actor.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    hub: SnapshotHub,
    router: Option<mpsc::UnboundedSender<RouterInput>>,
    backoff: Backoff,

    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    session_tx: mpsc::UnboundedSender<SessionEnvelope>,
    session_rx: mpsc::UnboundedReceiver<SessionEnvelope>,
    credential_changes: Option<watch::Receiver<Option<String>>>,

    state: ConnectionState,
    attempt: u32,
    last_error: Option<String>,
    connected_since: Option<chrono::DateTime<Utc>>,

    started: bool,
    network_reachable: bool,
    in_background: bool,
    background_deadline: Option<Instant>,
    timer: Option<(TimerKind, Instant)>,
    probe_used: bool,

    generation: u64,
    session: Option<Session>,
    token: Option<String>,
    ping_nonce: u64,
    outstanding_ping: Option<u64>,
    missed_pongs: u32,
}

impl ConnectionManager {
    /// Builds a manager and its handle. Call [`ConnectionManager::spawn`] or
    /// [`ConnectionManager::run`] to start it.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        router: Option<mpsc::UnboundedSender<RouterInput>>,
    ) -> (Self, ConnectionHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let hub = SnapshotHub::new();
        let credential_changes = Some(credentials.subscribe());
        let manager = Self {
            backoff: Backoff::from_config(&config),
            config,
            transport,
            credentials,
            hub: hub.clone(),
            router,
            commands,
            session_tx,
            session_rx,
            credential_changes,
            state: ConnectionState::Disconnected(DisconnectReason::NotStarted),
            attempt: 0,
            last_error: None,
            connected_since: None,
            started: false,
            network_reachable: true,
            in_background: false,
            background_deadline: None,
            timer: None,
            probe_used: false,
            generation: 0,
            session: None,
            token: None,
            ping_nonce: 0,
            outstanding_ping: None,
            missed_pongs: 0,
        };
        let handle = ConnectionHandle {
            commands: command_tx,
            hub,
        };
        (manager, handle)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs the actor until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("[CONN] manager started");
        loop {
            let wakeup = self.next_wakeup().await;
            match wakeup {
                Wakeup::Command(None) => {
                    self.teardown("manager dropped").await;
                    break;
                }
                Wakeup::Command(Some(ConnectionCommand::Shutdown(ack))) => {
                    self.teardown("shutdown").await;
                    self.timer = None;
                    self.transition(ConnectionState::Disconnected(DisconnectReason::Stopped));
                    let _ = ack.send(());
                    break;
                }
                Wakeup::Command(Some(command)) => self.handle_command(command).await,
                Wakeup::Session(envelope) => self.handle_session_event(envelope).await,
                Wakeup::Credentials(Some(token)) => self.handle_credentials(token).await,
                Wakeup::Credentials(None) => {
                    debug!("[CONN] credential source closed");
                    self.credential_changes = None;
                }
                Wakeup::Timer(kind) => {
                    self.timer = None;
                    self.handle_timer(kind).await;
                }
                Wakeup::BackgroundGraceElapsed => {
                    self.background_deadline = None;
                    self.suspend_for_background().await;
                }
            }
        }
        info!("[CONN] manager stopped");
    }

    async fn next_wakeup(&mut self) -> Wakeup {
        let far = Instant::now() + Duration::from_secs(86_400);
        let (timer_kind, timer_at) = match self.timer {
            Some((kind, at)) => (Some(kind), at),
            None => (None, far),
        };
        let background_at = self.background_deadline.unwrap_or(far);

        tokio::select! {
            command = self.commands.recv() => Wakeup::Command(command),
            Some(envelope) = self.session_rx.recv() => Wakeup::Session(envelope),
            token = credential_change(&mut self.credential_changes) => Wakeup::Credentials(token),
            () = sleep_until(timer_at), if timer_kind.is_some() => {
                Wakeup::Timer(timer_kind.unwrap_or(TimerKind::Reconnect))
            }
            () = sleep_until(background_at), if self.background_deadline.is_some() => {
                Wakeup::BackgroundGraceElapsed
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: ConnectionCommand) {
        debug!("[CONN] command {command:?} in {}", self.state);
        match command {
            ConnectionCommand::Start => {
                self.started = true;
                if matches!(self.state, ConnectionState::Disconnected(_)) {
                    self.try_connect().await;
                }
            }
            ConnectionCommand::Stop => {
                self.started = false;
                self.teardown("stopped").await;
                self.timer = None;
                self.transition(ConnectionState::Disconnected(DisconnectReason::Stopped));
            }
            ConnectionCommand::SetNetworkReachable(reachable) => {
                self.set_network_reachable(reachable).await;
            }
            ConnectionCommand::AppBackgrounded => {
                if !self.in_background {
                    self.in_background = true;
                    self.background_deadline =
                        Some(Instant::now() + self.config.background_grace());
                }
            }
            ConnectionCommand::AppForegrounded => {
                self.in_background = false;
                self.background_deadline = None;
                match self.state {
                    ConnectionState::BackgroundSuspended => {
                        info!("[CONN] foregrounded, starting a fresh connection");
                        self.attempt = 0;
                        self.try_connect().await;
                    }
                    ConnectionState::Backoff { .. } => self.probe_now().await,
                    _ => {}
                }
            }
            ConnectionCommand::ProbeNow => self.probe_now().await,
            ConnectionCommand::Shutdown(_) => {}
        }
    }

    async fn set_network_reachable(&mut self, reachable: bool) {
        if self.network_reachable == reachable {
            return;
        }
        self.network_reachable = reachable;
        if reachable {
            info!("[CONN] network reachable");
            if self.state == ConnectionState::Disconnected(DisconnectReason::NetworkUnreachable) {
                self.try_connect().await;
            }
            return;
        }

        info!("[CONN] network unreachable, cancelling connection work");
        if matches!(
            self.state,
            ConnectionState::Disconnected(_) | ConnectionState::BackgroundSuspended
        ) {
            return;
        }
        self.teardown("network unreachable").await;
        self.timer = None;
        self.transition(ConnectionState::Disconnected(
            DisconnectReason::NetworkUnreachable,
        ));
    }

    async fn probe_now(&mut self) {
        if !matches!(self.state, ConnectionState::Backoff { .. }) {
            return;
        }
        if self.probe_used {
            debug!("[CONN] probe already used in this backoff window");
            return;
        }
        info!("[CONN] probe requested, skipping backoff delay");
        self.probe_used = true;
        self.timer = None;
        self.try_connect().await;
    }

    async fn handle_credentials(&mut self, token: Option<String>) {
        if token.is_none() {
            debug!("[CONN] credentials cleared");
            return;
        }
        let waiting = matches!(
            self.state,
            ConnectionState::Backoff { .. }
                | ConnectionState::Disconnected(DisconnectReason::MissingCredentials)
        );
        if waiting {
            info!("[CONN] credentials available, retrying now");
            self.timer = None;
            self.try_connect().await;
        }
    }

    // ── Connecting ───────────────────────────────────────────────────

    fn can_connect(&self) -> bool {
        self.started && self.network_reachable
    }

    async fn try_connect(&mut self) {
        if !self.started {
            return;
        }
        if !self.network_reachable {
            self.transition(ConnectionState::Disconnected(
                DisconnectReason::NetworkUnreachable,
            ));
            return;
        }
        let Some(token) = self.credentials.current_token() else {
            info!("[CONN] no credentials, waiting for a token");
            self.teardown("missing credentials").await;
            self.transition(ConnectionState::Disconnected(
                DisconnectReason::MissingCredentials,
            ));
            return;
        };

        self.teardown("reconnecting").await;
        self.generation += 1;
        let scope = GenerationScope::new(self.generation);
        let session = Session::new(self.transport.clone(), scope, self.config.rpc_timeout());
        session.spawn(self.session_tx.clone());
        self.session = Some(session);
        self.token = Some(token);
        self.outstanding_ping = None;
        self.missed_pongs = 0;
        self.arm(TimerKind::ConnectTimeout, self.config.connect_timeout());
        self.transition(ConnectionState::Connecting);
    }

    // ── Session events ───────────────────────────────────────────────

    async fn handle_session_event(&mut self, envelope: SessionEnvelope) {
        let current = self.session.as_ref().map(Session::generation);
        if current != Some(envelope.generation) {
            debug!(
                "[CONN] dropping {:?} from stale generation {}",
                envelope.event, envelope.generation
            );
            return;
        }

        match envelope.event {
            SessionEvent::TransportOpened => {
                if self.state != ConnectionState::Connecting {
                    return;
                }
                let token = self.token.clone().unwrap_or_default();
                let sent = match &self.session {
                    Some(session) => {
                        session
                            .send_connection_init(&token, &self.config.client_version)
                            .await
                    }
                    None => Err(SyncError::NotConnected),
                };
                match sent {
                    Ok(()) => {
                        self.arm(TimerKind::HandshakeTimeout, self.config.handshake_timeout());
                        self.transition(ConnectionState::Handshaking);
                    }
                    Err(e) => self.fail(e).await,
                }
            }
            SessionEvent::HandshakeAccepted => {
                if self.state != ConnectionState::Handshaking {
                    return;
                }
                self.on_open();
            }
            SessionEvent::HandshakeFailed(error) => {
                if error.is_credential_failure() {
                    warn!("[CONN] handshake rejected credentials: {error}");
                }
                self.fail(SyncError::HandshakeRejected(error)).await;
            }
            SessionEvent::Updates(updates) => {
                if !self.state.is_open() {
                    debug!("[CONN] dropping {} update(s) before open", updates.len());
                    return;
                }
                self.notify_router(RouterInput::Updates {
                    generation: envelope.generation,
                    updates,
                });
            }
            SessionEvent::Pong(nonce) => {
                if self.outstanding_ping == Some(nonce) {
                    self.outstanding_ping = None;
                    self.missed_pongs = 0;
                }
            }
            SessionEvent::Closed(reason) => {
                if self.state == ConnectionState::Handshaking {
                    self.fail(SyncError::HandshakeRejected(HandshakeError::Closed(reason)))
                        .await;
                } else if self.state.is_active() {
                    self.fail(SyncError::Transport(reason)).await;
                }
            }
        }
    }

    fn on_open(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let rpc = session.rpc();
        self.attempt = 0;
        self.last_error = None;
        self.probe_used = false;
        self.connected_since = Some(Utc::now());
        self.arm(TimerKind::Ping, self.config.ping_interval());
        self.transition(ConnectionState::Open);
        self.notify_router(RouterInput::Connected { rpc });
    }

    // ── Timers ───────────────────────────────────────────────────────

    fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.timer = Some((kind, Instant::now() + after));
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ConnectTimeout => {
                if self.state == ConnectionState::Connecting {
                    self.fail(SyncError::Transport("connect timed out".into()))
                        .await;
                }
            }
            TimerKind::HandshakeTimeout => {
                if self.state == ConnectionState::Handshaking {
                    self.fail(SyncError::HandshakeRejected(HandshakeError::Timeout))
                        .await;
                }
            }
            TimerKind::Ping => self.health_tick().await,
            TimerKind::Reconnect => {
                if matches!(self.state, ConnectionState::Backoff { .. }) {
                    self.try_connect().await;
                }
            }
        }
    }

    async fn health_tick(&mut self) {
        if !self.state.is_open() {
            return;
        }
        if self.outstanding_ping.is_some() {
            self.missed_pongs += 1;
            warn!(
                "[CONN] missed pong ({}/{})",
                self.missed_pongs, self.config.max_missed_pongs
            );
        }
        if self.missed_pongs >= self.config.max_missed_pongs {
            self.fail(SyncError::Transport("health probe timed out".into()))
                .await;
            return;
        }

        self.ping_nonce = self.ping_nonce.wrapping_add(1);
        let nonce = self.ping_nonce;
        let sent = match &self.session {
            Some(session) => session.send_ping(nonce).await,
            None => Err(SyncError::NotConnected),
        };
        match sent {
            Ok(()) => {
                self.outstanding_ping = Some(nonce);
                self.arm(TimerKind::Ping, self.config.ping_interval());
            }
            Err(e) => self.fail(e).await,
        }
    }

    // ── Failure and teardown ─────────────────────────────────────────

    async fn fail(&mut self, error: SyncError) {
        warn!("[CONN] connection failed in {}: {error}", self.state);
        self.last_error = Some(error.to_string());
        self.teardown(&error.to_string()).await;

        if !self.can_connect() {
            self.timer = None;
            let reason = if self.network_reachable {
                DisconnectReason::Stopped
            } else {
                DisconnectReason::NetworkUnreachable
            };
            self.transition(ConnectionState::Disconnected(reason));
            return;
        }

        self.attempt = self.attempt.saturating_add(1);
        let delay = self.backoff.delay(self.attempt);
        let until = Instant::now() + delay;
        info!(
            "[CONN] retrying in {}ms (attempt {})",
            delay.as_millis(),
            self.attempt
        );
        self.probe_used = false;
        self.timer = Some((TimerKind::Reconnect, until));
        self.transition(ConnectionState::Backoff {
            until,
            attempt: self.attempt,
        });
    }

    /// Ends the current session: cancels its generation, closes the
    /// transport and tells the router the connection is gone.
    async fn teardown(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };
        let generation = session.generation();
        session.end(reason);
        if let Err(e) = self.transport.close().await {
            error!("[CONN] failed to close transport: {e}");
        }
        self.token = None;
        self.outstanding_ping = None;
        self.connected_since = None;
        self.notify_router(RouterInput::Disconnected { generation });
        debug!("[CONN] generation {generation} torn down: {reason}");
    }

    async fn suspend_for_background(&mut self) {
        if !self.started || self.state == ConnectionState::BackgroundSuspended {
            return;
        }
        info!("[CONN] background grace elapsed, stopping transport");
        let had_session = self.session.is_some();
        self.teardown("background suspended").await;
        if !had_session {
            if let Err(e) = self.transport.close().await {
                error!("[CONN] failed to close transport: {e}");
            }
        }
        self.timer = None;
        self.transition(ConnectionState::BackgroundSuspended);
    }

    // ── Publishing ───────────────────────────────────────────────────

    fn transition(&mut self, state: ConnectionState) {
        let previous = self.state;
        self.state = state;
        if previous != state {
            info!(
                "[CONN] {previous} -> {state} (attempt {})",
                self.attempt
            );
        }
        self.hub.publish(ConnectionSnapshot {
            state,
            attempt_number: self.attempt,
            last_error: self.last_error.clone(),
            connected_since: self.connected_since,
            changed_at: Utc::now(),
        });
    }

    fn notify_router(&self, input: RouterInput) {
        if let Some(router) = &self.router {
            if router.send(input).is_err() {
                debug!("[CONN] router is gone");
            }
        }
    }
}

async fn credential_change(
    changes: &mut Option<watch::Receiver<Option<String>>>,
) -> Option<Option<String>> {
    match changes {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
