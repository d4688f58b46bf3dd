//! Tunables for the connection manager and the bucket synchronizer.
//!
//! Durations are stored as integer milliseconds (or seconds, where the
//! server's own granularity is seconds) so the structs serialize cleanly;
//! accessor methods hand out `Duration`s.

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// First reconnect delay.
    pub backoff_base_ms: u64,
    /// Upper bound for the reconnect delay.
    pub backoff_max_ms: u64,
    /// Jitter applied to each delay, as a ratio of the delay (0.0 - 1.0).
    pub backoff_jitter: f64,
    /// How long to wait for the transport to report `opened`.
    pub connect_timeout_ms: u64,
    /// How long to wait for the server to confirm the handshake.
    pub handshake_timeout_ms: u64,
    /// Interval between health pings while open.
    pub ping_interval_ms: u64,
    /// Consecutive unanswered pings before the connection is declared dead.
    pub max_missed_pongs: u32,
    /// How long the app may stay in background before the transport is stopped.
    pub background_grace_ms: u64,
    /// Default deadline for RPCs.
    pub rpc_timeout_ms: u64,
    /// Version string sent with the handshake.
    pub client_version: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.2,
            connect_timeout_ms: 15_000,
            handshake_timeout_ms: 10_000,
            ping_interval_ms: 15_000,
            max_missed_pongs: 2,
            background_grace_ms: 60_000,
            rpc_timeout_ms: 15_000,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_millis(self.background_grace_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Bucket catch-up configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Gap (in seqs) beyond which a `tooLong` answer fast-forwards the bucket.
    pub max_total_gap: u64,
    /// Page size requested from `getUpdates`.
    pub get_updates_limit: u32,
    /// Requests one fetch may issue before it gives up and fast-forwards.
    pub max_slice_iterations: u32,
    /// Back-to-back refetches allowed before a delay is inserted.
    pub max_immediate_refetches: u32,
    /// Delay inserted once the immediate refetch budget is spent.
    pub refetch_delay_ms: u64,
    /// Subtracted from the newest applied date before it becomes `lastSyncDate`.
    pub last_sync_safety_gap_secs: u64,
    /// A `lastSyncDate` older than this is not trusted.
    pub max_sync_staleness_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_total_gap: 1_000,
            get_updates_limit: 50,
            max_slice_iterations: 32,
            max_immediate_refetches: 3,
            refetch_delay_ms: 1_000,
            last_sync_safety_gap_secs: 15,
            max_sync_staleness_secs: 14 * 24 * 60 * 60,
        }
    }
}

impl SyncConfig {
    pub fn refetch_delay(&self) -> Duration {
        Duration::from_millis(self.refetch_delay_ms)
    }

    pub fn last_sync_safety_gap(&self) -> Duration {
        Duration::from_secs(self.last_sync_safety_gap_secs)
    }

    pub fn max_sync_staleness(&self) -> Duration {
        Duration::from_secs(self.max_sync_staleness_secs)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
}

impl RealtimeConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::SyncError::Store(format!("failed to read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&contents)
    }
}
