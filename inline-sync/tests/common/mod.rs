#![allow(dead_code)]

use inline_sync::generation::GenerationScope;
use inline_sync::protocol::{
    ClientBody, ClientMessage, GetUpdatesKind, GetUpdatesResult, RpcCall, RpcResult, ServerBody,
    ServerMessage, ServerPush,
};
use inline_sync::session::{Session, SessionEnvelope, SessionEvent};
use inline_sync::transport::mock::{MockServer, MockTransport};
use inline_sync::{
    BucketContext, BucketReport, MemoryBucketStore, MemoryMessageStore, SyncConfig,
};
use inline_types::{
    Bucket, BucketCursor, ChatId, Message, MessageId, SpaceId, UnixTime, Update, UpdatePayload,
    UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

pub const BASE_DATE: i64 = 1_700_000_000;

// ── Update builders ──────────────────────────────────────────────

pub fn chat(id: i64) -> Bucket {
    Bucket::Chat(ChatId::new(id))
}

pub fn space(id: i64) -> Bucket {
    Bucket::Space(SpaceId::new(id))
}

pub fn date_of(seq: u64) -> UnixTime {
    UnixTime::from_secs(BASE_DATE + seq as i64)
}

pub fn make_message(chat_id: i64, id: i64, text: &str) -> Message {
    Message {
        id: MessageId::new(id),
        chat_id: ChatId::new(chat_id),
        from_id: UserId::new(1),
        text: Some(text.to_string()),
        date: UnixTime::from_secs(BASE_DATE + id),
    }
}

/// A new-message update at `seq` of the chat's bucket.
pub fn message_update(chat_id: i64, seq: u64) -> Update {
    Update::sequenced(
        seq,
        date_of(seq),
        UpdatePayload::NewMessage {
            message: make_message(chat_id, seq as i64, &format!("message {seq}")),
        },
    )
}

/// A member-added update at `seq` of the space's bucket.
pub fn member_update(space_id: i64, seq: u64) -> Update {
    Update::sequenced(
        seq,
        date_of(seq),
        UpdatePayload::SpaceMemberAdd {
            space_id: SpaceId::new(space_id),
            user_id: UserId::new(seq as i64),
        },
    )
}

/// An update of a kind this client does not understand.
pub fn unknown_update(seq: u64) -> Update {
    Update::sequenced(seq, date_of(seq), UpdatePayload::Unknown)
}

pub fn push_message(updates: Vec<Update>) -> ServerMessage {
    ServerMessage {
        id: 0,
        body: ServerBody::Message {
            push: ServerPush::Updates { updates },
        },
    }
}

// ── Config and context ───────────────────────────────────────────

pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        get_updates_limit: 5,
        ..SyncConfig::default()
    }
}

pub fn make_context(
    config: SyncConfig,
    store: &MemoryBucketStore,
    messages: &MemoryMessageStore,
) -> BucketContext {
    BucketContext {
        config,
        store: Arc::new(store.clone()),
        applicator: Arc::new(messages.clone()),
    }
}

// ── Fake server ──────────────────────────────────────────────────

/// Server-side state answering protocol traffic from a mock transport.
pub struct FakeState {
    pub buckets: HashMap<Bucket, BTreeMap<u64, Update>>,
    /// Unbounded requests spanning more seqs than this answer `tooLong`.
    pub too_long_gap: Option<u64>,
    /// Slice length suggested with `tooLong`.
    pub slice_size: u64,
    /// Number of upcoming `getUpdates` calls whose answers are held back.
    pub hold_get_updates: usize,
    pub held: Vec<ServerMessage>,
    pub get_updates_calls: Vec<(Bucket, u64, Option<u64>)>,
    pub state_probes: Vec<UnixTime>,
    pub reject_state_probes: usize,
    pub answer_init: bool,
    pub answer_pings: bool,
    /// Push "has new updates" notices after each state probe.
    pub notify_on_probe: bool,
    /// Leave `seq_end` out of non-final `normal` pages.
    pub omit_partial_seq_end: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            too_long_gap: None,
            slice_size: 10,
            hold_get_updates: 0,
            held: Vec::new(),
            get_updates_calls: Vec::new(),
            state_probes: Vec::new(),
            reject_state_probes: 0,
            answer_init: true,
            answer_pings: true,
            notify_on_probe: true,
            omit_partial_seq_end: false,
        }
    }
}

impl FakeState {
    pub fn server_cursor(&self, bucket: Bucket) -> (u64, UnixTime) {
        self.buckets
            .get(&bucket)
            .and_then(|updates| updates.iter().next_back())
            .map(|(seq, update)| (*seq, update.date.unwrap_or_default()))
            .unwrap_or((0, UnixTime::EPOCH))
    }

    pub fn answer_get_updates(
        &self,
        bucket: Bucket,
        start_seq: u64,
        seq_end: Option<u64>,
        limit: u32,
    ) -> GetUpdatesResult {
        let (server_seq, server_date) = self.server_cursor(bucket);
        if seq_end.is_none() {
            if let Some(max_span) = self.too_long_gap {
                if server_seq.saturating_sub(start_seq) > max_span {
                    return GetUpdatesResult {
                        updates: Vec::new(),
                        result_kind: GetUpdatesKind::TooLong,
                        seq_end: Some(start_seq + self.slice_size),
                        server_seq,
                        server_date,
                        is_final: false,
                    };
                }
            }
        }

        let end = seq_end.unwrap_or(server_seq).min(server_seq);
        let page: Vec<Update> = match self.buckets.get(&bucket) {
            Some(updates) if start_seq < end => updates
                .range(start_seq + 1..=end)
                .take(limit as usize)
                .map(|(_, update)| update.clone())
                .collect(),
            _ => Vec::new(),
        };
        let last = page.last().and_then(|u| u.seq).unwrap_or(start_seq);
        let is_final = last >= end;
        GetUpdatesResult {
            updates: page,
            result_kind: GetUpdatesKind::Normal,
            seq_end: match (is_final, self.omit_partial_seq_end) {
                (true, _) => Some(end),
                (false, true) => None,
                (false, false) => Some(last),
            },
            server_seq,
            server_date,
            is_final,
        }
    }

    fn respond(&mut self, message: &ClientMessage) -> Vec<ServerMessage> {
        let reply = |body| ServerMessage {
            id: message.id.wrapping_add(1),
            body,
        };
        match &message.body {
            ClientBody::ConnectionInit { .. } => {
                if self.answer_init {
                    vec![reply(ServerBody::ConnectionOpen)]
                } else {
                    Vec::new()
                }
            }
            ClientBody::Ping { nonce } => {
                if self.answer_pings {
                    vec![reply(ServerBody::Pong { nonce: *nonce })]
                } else {
                    Vec::new()
                }
            }
            ClientBody::RpcCall {
                call: RpcCall::GetUpdatesState { date },
            } => {
                self.state_probes.push(*date);
                if self.reject_state_probes > 0 {
                    self.reject_state_probes -= 1;
                    return vec![reply(ServerBody::RpcError {
                        req_msg_id: message.id,
                        error_code: 1,
                        message: "date too old".into(),
                        code: 400,
                    })];
                }
                let mut out = vec![reply(ServerBody::RpcResult {
                    req_msg_id: message.id,
                    result: RpcResult::GetUpdatesState { date: *date },
                })];
                if self.notify_on_probe {
                    let notices: Vec<Update> = self
                        .buckets
                        .keys()
                        .map(|bucket| {
                            let (seq, _) = self.server_cursor(*bucket);
                            match bucket {
                                Bucket::Chat(id) => Update::chat_notice(*id, seq),
                                Bucket::Space(id) => Update::space_notice(*id, seq),
                            }
                        })
                        .collect();
                    if !notices.is_empty() {
                        out.push(push_message(notices));
                    }
                }
                out
            }
            ClientBody::RpcCall {
                call:
                    RpcCall::GetUpdates {
                        bucket,
                        start_seq,
                        seq_end,
                        limit,
                    },
            } => {
                self.get_updates_calls.push((*bucket, *start_seq, *seq_end));
                let result = self.answer_get_updates(*bucket, *start_seq, *seq_end, *limit);
                let answer = reply(ServerBody::RpcResult {
                    req_msg_id: message.id,
                    result: RpcResult::GetUpdates(result),
                });
                if self.hold_get_updates > 0 {
                    self.hold_get_updates -= 1;
                    self.held.push(answer);
                    Vec::new()
                } else {
                    vec![answer]
                }
            }
        }
    }
}

/// Shared handle to a [`FakeState`], attachable to any number of mock servers.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Makes `server` answer client traffic from this state.
    pub fn attach(&self, server: &MockServer) {
        let state = self.state.clone();
        server.set_responder(move |message| state.lock().unwrap().respond(message));
    }

    /// Adds updates to the server's buckets.
    pub fn add(&self, updates: impl IntoIterator<Item = Update>) {
        let mut state = self.lock();
        for update in updates {
            let bucket = update.bucket().expect("bucketed update");
            let seq = update.seq.expect("sequenced update");
            state.buckets.entry(bucket).or_default().insert(seq, update);
        }
    }

    /// Stores updates under `bucket` regardless of their payload.
    pub fn add_to(&self, bucket: Bucket, updates: impl IntoIterator<Item = Update>) {
        let mut state = self.lock();
        let stored = state.buckets.entry(bucket).or_default();
        for update in updates {
            let seq = update.seq.expect("sequenced update");
            stored.insert(seq, update);
        }
    }

    pub fn get_updates_calls(&self) -> Vec<(Bucket, u64, Option<u64>)> {
        self.lock().get_updates_calls.clone()
    }

    pub fn state_probes(&self) -> Vec<UnixTime> {
        self.lock().state_probes.clone()
    }

    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Delivers every held answer, in request order.
    pub fn release_held(&self, server: &MockServer) {
        let held = std::mem::take(&mut self.lock().held);
        for message in held {
            assert!(server.push(message), "client disconnected");
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────

/// Opens a session of `generation` over `transport` and waits for `opened`.
pub async fn open_session(
    transport: MockTransport,
    generation: u64,
) -> (Session, mpsc::UnboundedReceiver<SessionEnvelope>) {
    let session = Session::new(
        Arc::new(transport),
        GenerationScope::new(generation),
        Duration::from_secs(5),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.spawn(tx);
    let first = rx.recv().await.expect("session event");
    assert_eq!(first.event, SessionEvent::TransportOpened);
    (session, rx)
}

/// A fake server plus one open session against it.
///
/// Keep `events` alive: the session stops reading once nobody listens.
pub struct Connected {
    pub fake: FakeServer,
    pub server: MockServer,
    pub session: Session,
    pub events: mpsc::UnboundedReceiver<SessionEnvelope>,
}

pub async fn connect_to(fake: &FakeServer, generation: u64) -> Connected {
    let (transport, server) = MockTransport::pair();
    fake.attach(&server);
    let (session, events) = open_session(transport, generation).await;
    Connected {
        fake: fake.clone(),
        server,
        session,
        events,
    }
}

pub async fn connected_fake(generation: u64) -> Connected {
    connect_to(&FakeServer::new(), generation).await
}

// ── Waiting ──────────────────────────────────────────────────────

/// Waits until `bucket` reports synced at or beyond `seq`.
pub async fn wait_synced(
    reports: &mut mpsc::UnboundedReceiver<BucketReport>,
    bucket: Bucket,
    seq: u64,
) -> BucketCursor {
    let wait = async {
        loop {
            match reports.recv().await {
                Some(BucketReport::Synced { bucket: b, cursor }) if b == bucket && cursor.seq >= seq => {
                    return cursor;
                }
                Some(_) => {}
                None => panic!("report channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .expect("bucket did not sync in time")
}

/// Polls `condition` every millisecond until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .expect("condition not reached in time");
}

/// Lets every task run until idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
