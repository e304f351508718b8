use crate::error::StreamError;
use crate::model::{ChunkAddress, NonSpatialCoords, PyramidModel};
use crate::volume::VoxelData;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    #[error("fetch cancelled")]
    Cancelled,
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not decode chunk: {0}")]
    Decode(String),
    #[error("level {0} is not known to this store")]
    UnknownLevel(usize),
}
impl FetchError {
    /// `Cancelled` is a no-op outcome, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation of a chunk fetch.
///
/// Cancelling is idempotent. Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            self.state.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Whether `other` is a clone of this token.
    pub fn same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // register before checking the flag so a concurrent cancel is not missed
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Runs `fut` unless the token fires first, in which case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, FetchError> {
        if self.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(FetchError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

/// Source of pyramid metadata and decoded chunks.
///
/// Implementations must be safe to call concurrently for different addresses
/// and must return `FetchError::Cancelled` once `cancel` fires.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn fetch_metadata(&self) -> Result<PyramidModel, StreamError>;

    /// Returns the chunk at `address` within the slice selected by
    /// `non_spatial`. Edge chunks may be smaller than the nominal chunk shape.
    async fn fetch_chunk(
        &self,
        address: &ChunkAddress,
        non_spatial: &NonSpatialCoords,
        cancel: &CancelToken,
    ) -> Result<VoxelData, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(token.same(&clone));
        assert!(!token.same(&CancelToken::new()));
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        // already cancelled tokens resolve immediately
        token.cancelled().await;
    }

    #[tokio::test]
    async fn run_drops_future_on_cancel() {
        let token = CancelToken::new();
        assert_eq!(token.run(async { 7 }).await, Ok(7));

        let pending = token.run(std::future::pending::<()>());
        let canceller = async {
            tokio::task::yield_now().await;
            token.cancel();
        };
        let (result, _) = tokio::join!(pending, canceller);
        assert_eq!(result, Err(FetchError::Cancelled));
        assert_eq!(token.run(async { 7 }).await, Err(FetchError::Cancelled));
    }
}
