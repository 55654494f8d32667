//! Events published by the fetch manager.
//!
//! Consumers subscribe instead of polling. Every event carries the key it is
//! about, so one stream can be filtered down to a single asset.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Lifecycle of one key inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadState {
    /// Admitted but waiting for a free transfer slot.
    Queued,
    /// A worker is moving bytes.
    Transferring,
    /// A worker is waiting out a backoff delay.
    Retrying,
    /// Committed to the final path.
    Succeeded,
    /// Terminal failure or cancellation.
    Failed,
}

impl DownloadState {
    /// Returns true once the key will not change state again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Aggregate progress of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    /// Batch the update belongs to.
    pub batch: u64,
    /// Keys finished so far.
    pub completed: usize,
    /// Keys in the batch.
    pub total: usize,
}

/// Something observable happened to a key or batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// A key moved to a new state.
    StateChanged {
        /// Key of the request.
        key: String,
        /// New state.
        state: DownloadState,
    },
    /// Transfer progress, throttled.
    Progress {
        /// Key of the request.
        key: String,
        /// Fraction in `0.0..=1.0`.
        fraction: f64,
    },
    /// A network failure will be retried after `delay`.
    Retry {
        /// Key of the request.
        key: String,
        /// Attempt that just failed, starting at 1.
        attempt: u32,
        /// Backoff before the next attempt.
        delay: Duration,
        /// What went wrong.
        message: String,
    },
    /// The final file is in place.
    Complete {
        /// Key of the request.
        key: String,
    },
    /// The request failed for good.
    Error {
        /// Key of the request.
        key: String,
        /// Human readable failure.
        message: String,
    },
    /// The request was cancelled; its `.temp` file is kept.
    Cancelled {
        /// Key of the request.
        key: String,
    },
    /// A batch member finished.
    BatchProgress(BatchProgress),
}

impl FetchEvent {
    /// Returns the key this event is about, if any.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::StateChanged { key, .. }
            | Self::Progress { key, .. }
            | Self::Retry { key, .. }
            | Self::Complete { key }
            | Self::Error { key, .. }
            | Self::Cancelled { key } => Some(key),
            Self::BatchProgress(_) => None,
        }
    }
}

/// Stream of [`FetchEvent`]s from one subscription.
///
/// Slow consumers skip events they lagged behind on rather than erroring.
pub struct EventStream {
    inner: BroadcastStream<FetchEvent>,
    key: Option<String>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<FetchEvent>, key: Option<String>) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
            key,
        }
    }
}

impl Stream for EventStream {
    type Item = FetchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    let wanted = self
                        .key
                        .as_deref()
                        .is_none_or(|key| event.key() == Some(key));
                    if wanted {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                    log::debug!("event subscriber lagged, skipped {n} events");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
