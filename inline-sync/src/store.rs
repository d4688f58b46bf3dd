//! Bucket state persistence.
//!
//! Stores one cursor per bucket plus the global `lastSyncDate`. Each bucket
//! has a single writer (its sync worker), so a save is a plain atomic upsert.

use async_trait::async_trait;
use inline_types::{Bucket, BucketCursor, UnixTime};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Durable bucket cursors and the global sync date.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Loads a bucket's cursor, if one was ever saved.
    async fn load(&self, bucket: Bucket) -> SyncResult<Option<BucketCursor>>;

    /// Saves a bucket's cursor, replacing any previous value.
    async fn save(&self, bucket: Bucket, cursor: BucketCursor) -> SyncResult<()>;

    async fn load_global_last_sync_date(&self) -> SyncResult<Option<UnixTime>>;

    async fn save_global_last_sync_date(&self, date: UnixTime) -> SyncResult<()>;
}

// ── In-memory store ──────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    cursors: HashMap<Bucket, BucketCursor>,
    last_sync_date: Option<UnixTime>,
    fail_saves: usize,
}

/// Volatile store, for tests and ephemeral clients.
#[derive(Clone, Default)]
pub struct MemoryBucketStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds a cursor without going through the async API.
    pub fn insert(&self, bucket: Bucket, cursor: BucketCursor) {
        self.lock().cursors.insert(bucket, cursor);
    }

    /// Seeds the global sync date.
    pub fn set_last_sync_date(&self, date: Option<UnixTime>) {
        self.lock().last_sync_date = date;
    }

    pub fn cursor(&self, bucket: Bucket) -> Option<BucketCursor> {
        self.lock().cursors.get(&bucket).copied()
    }

    pub fn last_sync_date(&self) -> Option<UnixTime> {
        self.lock().last_sync_date
    }

    /// Makes the next `n` saves fail.
    pub fn fail_next_saves(&self, n: usize) {
        self.lock().fail_saves = n;
    }

    fn take_failure(state: &mut MemoryState) -> SyncResult<()> {
        if state.fail_saves > 0 {
            state.fail_saves -= 1;
            return Err(SyncError::Store("injected save failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn load(&self, bucket: Bucket) -> SyncResult<Option<BucketCursor>> {
        Ok(self.cursor(bucket))
    }

    async fn save(&self, bucket: Bucket, cursor: BucketCursor) -> SyncResult<()> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        state.cursors.insert(bucket, cursor);
        Ok(())
    }

    async fn load_global_last_sync_date(&self) -> SyncResult<Option<UnixTime>> {
        Ok(self.last_sync_date())
    }

    async fn save_global_last_sync_date(&self, date: UnixTime) -> SyncResult<()> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        state.last_sync_date = Some(date);
        Ok(())
    }
}

// ── SQLite store ─────────────────────────────────────────────────

const LAST_SYNC_DATE_KEY: &str = "last_sync_date";

/// Persistent store backed by SQLite.
#[derive(Clone)]
pub struct SqliteBucketStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBucketStore {
    /// Opens (or creates) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            SyncError::Store(format!("failed to open bucket store {}: {e}", path.display()))
        })?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Store(format!("failed to open in-memory bucket store: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> SyncResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS bucket_state (
                bucket_key TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                date INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| SyncError::Store(format!("failed to init bucket schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> SyncResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(|e| SyncError::Store(format!("store task failed: {e}")))?
    }
}

fn seq_to_sql(seq: u64) -> SyncResult<i64> {
    i64::try_from(seq).map_err(|_| SyncError::Store(format!("seq {seq} out of range")))
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    async fn load(&self, bucket: Bucket) -> SyncResult<Option<BucketCursor>> {
        let key = bucket.key();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT seq, date FROM bucket_state WHERE bucket_key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            Ok(row.map(|(seq, date)| {
                BucketCursor::new(u64::try_from(seq).unwrap_or(0), UnixTime::from_secs(date))
            }))
        })
        .await
    }

    async fn save(&self, bucket: Bucket, cursor: BucketCursor) -> SyncResult<()> {
        let key = bucket.key();
        let seq = seq_to_sql(cursor.seq)?;
        let date = cursor.date.as_secs();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO bucket_state (bucket_key, seq, date) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bucket_key) DO UPDATE SET seq = excluded.seq, date = excluded.date",
                params![key, seq, date],
            )?;
            debug!("[STORE] saved {key} at seq {seq}");
            Ok(())
        })
        .await
    }

    async fn load_global_last_sync_date(&self) -> SyncResult<Option<UnixTime>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM sync_meta WHERE key = ?1",
                    params![LAST_SYNC_DATE_KEY],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(value.map(UnixTime::from_secs))
        })
        .await
    }

    async fn save_global_last_sync_date(&self, date: UnixTime) -> SyncResult<()> {
        let secs = date.as_secs();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![LAST_SYNC_DATE_KEY, secs],
            )?;
            Ok(())
        })
        .await
    }
}
