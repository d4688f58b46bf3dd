//! Connection lifecycle: state, backoff, credentials and the manager actor.

mod backoff;
mod credentials;
mod manager;
mod state;

pub use backoff::Backoff;
pub use credentials::{CredentialSource, TokenCell};
pub use manager::{ConnectionHandle, ConnectionManager};
pub use state::{
    ConnectionSnapshot, ConnectionState, DisconnectReason, SnapshotHub, SnapshotStream,
    TRANSITION_LOG_CAPACITY, Transition,
};
