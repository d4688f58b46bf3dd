//! Connection generations.
//!
//! Every connection attempt gets a new generation number and a cancellation
//! token. Work started on behalf of a connection carries its scope and stops
//! at its next suspension point once the scope is cancelled.

use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};

/// Identity and cancellation handle of one connection attempt.
#[derive(Debug, Clone)]
pub struct GenerationScope {
    generation: u64,
    cancel: CancellationToken,
}

impl GenerationScope {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            cancel: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancels all work bound to this generation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the generation is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Fails with [`SyncError::Cancelled`] if the generation was superseded.
    pub fn check(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs `fut` unless the generation is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = fut => result,
        }
    }
}
