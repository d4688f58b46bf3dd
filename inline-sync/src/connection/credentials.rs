//! Access token source.

use tokio::sync::watch;

/// Where the connection manager gets its auth token.
///
/// Token acquisition lives elsewhere; the manager only reads the current
/// value and reacts when a new one appears.
pub trait CredentialSource: Send + Sync {
    /// The token to connect with, if any.
    fn current_token(&self) -> Option<String>;

    /// Notifies on every token change.
    fn subscribe(&self) -> watch::Receiver<Option<String>>;
}

/// In-memory credential source backed by a watch channel.
#[derive(Debug, Clone)]
pub struct TokenCell {
    tx: watch::Sender<Option<String>>,
}

impl Default for TokenCell {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TokenCell {
    pub fn new(token: Option<String>) -> Self {
        let (tx, _rx) = watch::channel(token);
        Self { tx }
    }

    /// Replaces the token and notifies subscribers.
    pub fn set(&self, token: impl Into<String>) {
        self.tx.send_replace(Some(token.into()));
    }

    /// Removes the token, e.g. on logout.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

impl CredentialSource for TokenCell {
    fn current_token(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}
