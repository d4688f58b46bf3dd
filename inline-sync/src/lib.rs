//! Realtime sync engine for the Inline client.
//!
//! Keeps a local message store consistent with the server's sequenced update
//! stream over a connection that drops, reconnects and gets suspended.
//!
//! # Architecture
//!
//! - **Transport**: one ordered message channel, owned by the connection manager
//! - **Session**: handshake, RPC correlation and demultiplexing for one connection
//! - **Connection manager**: lifecycle, backoff, health pings, snapshots
//! - **Router**: applies unsequenced updates, routes the rest to bucket workers
//! - **Bucket workers**: per-bucket ordering, buffering and `getUpdates` catch-up
//! - **Store**: persisted bucket cursors and the global `lastSyncDate`
//!
//! Every component with mutable state is an actor fed through a channel.
//! Work done on behalf of a connection is tied to that connection's
//! generation and stops once a newer connection supersedes it.
//!
//! # Example
//!
//! ```no_run
//! use inline_sync::transport::mock::MockTransport;
//! use inline_sync::{
//!     MemoryBucketStore, MemoryMessageStore, RealtimeConfig, TokenCell, create_realtime,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> inline_sync::SyncResult<()> {
//! let (transport, _server) = MockTransport::pair();
//! let realtime = create_realtime(
//!     RealtimeConfig::default(),
//!     Arc::new(transport),
//!     Arc::new(TokenCell::new(Some("token".into()))),
//!     Arc::new(MemoryBucketStore::new()),
//!     Arc::new(MemoryMessageStore::new()),
//! );
//! realtime.start()?;
//! realtime.shutdown().await
//! # }
//! ```

pub mod applicator;
pub mod bucket;
pub mod codec;
pub mod config;
pub mod connection;
mod error;
pub mod generation;
pub mod protocol;
mod realtime;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;

pub use applicator::{MemoryMessageStore, MessageStoreState, UpdateApplicator};
pub use bucket::{BucketContext, BucketReport, BucketWorkerHandle, spawn_bucket_worker};
pub use config::{ConnectionConfig, RealtimeConfig, SyncConfig};
pub use connection::{
    ConnectionHandle, ConnectionManager, ConnectionSnapshot, ConnectionState, CredentialSource,
    DisconnectReason, SnapshotStream, TokenCell,
};
pub use error::{HandshakeError, SyncError, SyncResult};
pub use generation::GenerationScope;
pub use realtime::{RealtimeHandle, create_realtime};
pub use router::{RouterInput, UpdateRouter};
pub use session::{RpcClient, Session, SessionEvent};
pub use store::{BucketStore, MemoryBucketStore, SqliteBucketStore};
pub use transport::{Transport, TransportEvent};
