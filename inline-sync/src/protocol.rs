//! Realtime protocol messages.
//!
//! The client and server exchange envelopes over one ordered connection:
//! 1. The client opens with `ConnectionInit` carrying its token
//! 2. The server answers `ConnectionOpen` or `ConnectionError`
//! 3. The client issues RPCs; each `RpcResult`/`RpcError` names the id of the
//!    call it answers
//! 4. The server pushes update batches and answers pings at any time

use inline_types::{Bucket, UnixTime, Update};
use serde::{Deserialize, Serialize};

/// Protocol layer advertised in the handshake.
pub const PROTOCOL_LAYER: u32 = 1;

/// Seconds between the Unix epoch and 2025-01-01T00:00:00Z, the base of message ids.
pub const MESSAGE_ID_EPOCH_SECS: u64 = 1_735_689_600;

// ── Client → server ──────────────────────────────────────────────

/// A message sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Unique id, echoed by the server in replies.
    pub id: u64,
    /// Per-connection send counter.
    pub seq: u32,
    pub body: ClientBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientBody {
    ConnectionInit {
        token: String,
        layer: u32,
        client_version: String,
    },
    RpcCall {
        call: RpcCall,
    },
    Ping {
        nonce: u64,
    },
}

/// RPCs the sync engine issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcCall {
    /// Asks the server to push "has new updates" notices for every bucket
    /// that changed since `date`.
    GetUpdatesState { date: UnixTime },
    /// Fetches updates of one bucket with `start_seq < seq <= seq_end`.
    GetUpdates {
        bucket: Bucket,
        start_seq: u64,
        #[serde(default)]
        seq_end: Option<u64>,
        limit: u32,
    },
}

impl RpcCall {
    /// Method name for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetUpdatesState { .. } => "getUpdatesState",
            Self::GetUpdates { .. } => "getUpdates",
        }
    }
}

// ── Server → client ──────────────────────────────────────────────

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: u64,
    pub body: ServerBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerBody {
    ConnectionOpen,
    ConnectionError {
        kind: ConnectionErrorKind,
        #[serde(default)]
        message: String,
    },
    RpcResult {
        req_msg_id: u64,
        result: RpcResult,
    },
    RpcError {
        req_msg_id: u64,
        error_code: i32,
        #[serde(default)]
        message: String,
        #[serde(default)]
        code: i32,
    },
    Message {
        push: ServerPush,
    },
    Pong {
        nonce: u64,
    },
}

/// Why the server refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    Unauthorized,
    ProtocolMismatch,
    #[serde(other)]
    Other,
}

/// Unsolicited server traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerPush {
    Updates { updates: Vec<Update> },
}

/// Typed RPC results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcResult {
    /// Acknowledges a state probe. Changes arrive as pushed notices.
    GetUpdatesState { date: UnixTime },
    GetUpdates(GetUpdatesResult),
}

/// How the server answered a `getUpdates` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GetUpdatesKind {
    /// `updates` holds (a page of) the requested range.
    Normal,
    /// The range is too large to return; `seq_end` may suggest a slice.
    TooLong,
}

/// Result of `getUpdates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetUpdatesResult {
    #[serde(default)]
    pub updates: Vec<Update>,
    pub result_kind: GetUpdatesKind,
    /// For `Normal`: the last seq covered by this page. For `TooLong`: the
    /// inclusive end of the slice the client should request next.
    #[serde(default)]
    pub seq_end: Option<u64>,
    /// The bucket's current seq on the server.
    pub server_seq: u64,
    /// The bucket's current date on the server.
    pub server_date: UnixTime,
    /// Whether this page reaches the end of the requested range.
    #[serde(rename = "final")]
    pub is_final: bool,
}

// ── Message ids ──────────────────────────────────────────────────

/// Time-ordered message id generator.
///
/// Ids pack the seconds since [`MESSAGE_ID_EPOCH_SECS`] into the upper 32
/// bits and a per-second counter into the lower 32 bits.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    last_timestamp: u64,
    sequence: u32,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces the next id for the current wall-clock second.
    pub fn next_id(&mut self) -> u64 {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        self.next_id_at(now)
    }

    /// Produces the next id as if the clock read `unix_secs`.
    pub fn next_id_at(&mut self, unix_secs: u64) -> u64 {
        let timestamp = unix_secs.saturating_sub(MESSAGE_ID_EPOCH_SECS);
        if timestamp == self.last_timestamp {
            self.sequence = self.sequence.wrapping_add(1);
        } else {
            self.sequence = 0;
            self.last_timestamp = timestamp;
        }
        (timestamp << 32) | u64::from(self.sequence)
    }
}
