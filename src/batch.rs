//! Batch coordinator: one completion and aggregate progress for a set of keys.

use std::collections::HashSet;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{FetchError, Result};
use crate::event::{BatchProgress, FetchEvent};
use crate::layout;
use crate::scheduler::{Completion, Ensured, FetchManager, Outcome};

/// Handle to a running batch.
///
/// Progress updates are buffered, so a caller may read them at its own pace
/// or ignore them and only [`wait`](Self::wait).
#[derive(Debug)]
pub struct Batch {
    id: u64,
    total: usize,
    progress: mpsc::UnboundedReceiver<BatchProgress>,
    outcome: oneshot::Receiver<std::result::Result<(), FetchError>>,
}

impl Batch {
    /// Identifier carried by this batch's [`FetchEvent::BatchProgress`] events.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Number of distinct keys in the batch.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Returns the next `(completed, total)` update, or `None` once the batch
    /// has finished or failed.
    pub async fn next_progress(&mut self) -> Option<BatchProgress> {
        self.progress.recv().await
    }

    /// Waits until every key is in place or the first one fails.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::BatchPartialFailure`] naming the first key that
    /// failed. Files already committed stay on disk.
    pub async fn wait(self) -> std::result::Result<(), FetchError> {
        self.outcome.await.unwrap_or(Err(FetchError::Cancelled))
    }
}

/// Per-batch bookkeeping. `completed` only grows and never passes `total`.
#[derive(Debug)]
struct BatchState {
    id: u64,
    total: usize,
    completed: usize,
    failed_key: Option<String>,
}

enum Admitted {
    Done(Outcome),
    Waiting(Completion),
}

struct Coordinator {
    manager: FetchManager,
    state: BatchState,
    started: Vec<String>,
    progress: mpsc::UnboundedSender<BatchProgress>,
    outcome: Option<oneshot::Sender<std::result::Result<(), FetchError>>>,
}

impl Coordinator {
    const fn is_settled(&self) -> bool {
        self.outcome.is_none()
    }

    fn settle(&mut self, result: std::result::Result<(), FetchError>) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(result);
        }
    }

    async fn run(mut self, keys: Vec<String>) {
        let stagger = self.manager.config().batch_stagger();
        let mut pending: FuturesUnordered<BoxFuture<'static, (String, Outcome)>> =
            FuturesUnordered::new();

        for (i, key) in keys.into_iter().enumerate() {
            if i > 0 && !stagger.is_zero() {
                let pause = tokio::time::sleep(stagger);
                tokio::pin!(pause);
                loop {
                    tokio::select! {
                        () = &mut pause => break,
                        Some((done, outcome)) = pending.next(), if !pending.is_empty() => {
                            self.record(&done, outcome);
                        }
                    }
                }
            }
            if self.is_settled() {
                break;
            }
            match self.admit(&key).await {
                Admitted::Done(outcome) => self.record(&key, outcome),
                Admitted::Waiting(completion) => {
                    pending.push(async move { (key, completion.wait().await) }.boxed());
                }
            }
        }

        while !self.is_settled() {
            let Some((key, outcome)) = pending.next().await else {
                break;
            };
            self.record(&key, outcome);
        }
        log::debug!(
            "batch {}: coordinator done ({}/{})",
            self.state.id,
            self.state.completed,
            self.state.total
        );
    }

    async fn admit(&mut self, key: &str) -> Admitted {
        loop {
            match self.manager.ensure_file(key).await {
                Ok(Ensured::Fresh(path)) => return Admitted::Done(Ok(path)),
                Ok(Ensured::Pending(completion)) => {
                    self.started.push(key.to_string());
                    return Admitted::Waiting(completion);
                }
                Ok(Ensured::InFlight) => {
                    if let Some(completion) = self.manager.watch(key) {
                        return Admitted::Waiting(completion);
                    }
                    // Finished between the two calls; look again.
                }
                Err(e) => return Admitted::Done(Err(FetchError::Io(e.to_string()))),
            }
        }
    }

    fn record(&mut self, key: &str, outcome: Outcome) {
        if self.state.failed_key.is_some() {
            return;
        }
        match outcome {
            Ok(_) => {
                self.state.completed = (self.state.completed + 1).min(self.state.total);
                let update = BatchProgress {
                    batch: self.state.id,
                    completed: self.state.completed,
                    total: self.state.total,
                };
                self.manager.emit(FetchEvent::BatchProgress(update));
                let _ = self.progress.send(update);
                if self.state.completed == self.state.total {
                    log::info!("batch {}: all {} file(s) ready", self.state.id, self.state.total);
                    self.settle(Ok(()));
                }
            }
            Err(source) => {
                log::error!("batch {}: {key} failed: {source}", self.state.id);
                self.state.failed_key = Some(key.to_string());
                if self.manager.config().cancel_batch_on_failure {
                    for sibling in self.started.iter().filter(|k| k.as_str() != key) {
                        if self.manager.cancel_download(sibling) {
                            log::info!("batch {}: cancelled {sibling}", self.state.id);
                        }
                    }
                }
                self.settle(Err(FetchError::BatchPartialFailure {
                    key: key.to_string(),
                    source: Box::new(source),
                }));
            }
        }
    }
}

impl FetchManager {
    /// Ensures every key in `keys`, reporting aggregate progress.
    ///
    /// Duplicate keys count once. Starts are spaced by the configured stagger.
    /// Keys already in flight are awaited rather than requested again. Must be
    /// called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidKey`] before anything starts if any key
    /// is not a safe relative path.
    pub fn ensure_files<I, S>(&self, keys: I) -> Result<Batch>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for key in keys {
            let key = key.into();
            layout::validate_key(&key)?;
            if seen.insert(key.clone()) {
                unique.push(key);
            }
        }

        let id = self.next_batch_id();
        let total = unique.len();
        let (progress_tx, progress) = mpsc::unbounded_channel();
        let (outcome_tx, outcome) = oneshot::channel();
        log::info!("batch {id}: {total} file(s)");

        if total == 0 {
            let _ = outcome_tx.send(Ok(()));
        } else {
            let coordinator = Coordinator {
                manager: self.clone(),
                state: BatchState {
                    id,
                    total,
                    completed: 0,
                    failed_key: None,
                },
                started: Vec::new(),
                progress: progress_tx,
                outcome: Some(outcome_tx),
            };
            tokio::spawn(coordinator.run(unique));
        }

        Ok(Batch {
            id,
            total,
            progress,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::FetchConfig;
    use tempfile::TempDir;

    fn offline_manager(dir: &TempDir) -> FetchManager {
        let config = FetchConfig::new("http://127.0.0.1:9", dir.path())
            .with_check_freshness(false)
            .with_batch_stagger(Duration::ZERO);
        FetchManager::new(config).unwrap()
    }

    #[tokio::test]
    async fn empty_batch_completes_at_once() {
        let dir = TempDir::new().unwrap();
        let mut batch = offline_manager(&dir).ensure_files(Vec::<String>::new()).unwrap();
        assert_eq!(batch.total(), 0);
        assert!(batch.next_progress().await.is_none());
        assert!(batch.wait().await.is_ok());
    }

    #[tokio::test]
    async fn invalid_key_rejects_whole_batch() {
        let dir = TempDir::new().unwrap();
        let m = offline_manager(&dir);
        let err = m.ensure_files(["ok.mp4", "/abs.mp4"]).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidKey { .. }));
        assert!(!m.is_downloading("ok.mp4"));
    }

    #[tokio::test]
    async fn present_files_count_as_progress() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"a").unwrap();
        std::fs::write(dir.path().join("b.ogg"), b"b").unwrap();
        let m = offline_manager(&dir);

        let mut batch = m.ensure_files(["a.mp4", "b.ogg", "a.mp4"]).unwrap();
        assert_eq!(batch.total(), 2);

        let mut seen = Vec::new();
        while let Some(update) = batch.next_progress().await {
            assert_eq!(update.batch, batch.id());
            seen.push((update.completed, update.total));
        }
        assert_eq!(seen, vec![(1, 2), (2, 2)]);
        assert!(batch.wait().await.is_ok());
    }

    #[tokio::test]
    async fn batch_ids_are_distinct() {
        let dir = TempDir::new().unwrap();
        let m = offline_manager(&dir);
        let a = m.ensure_files(Vec::<String>::new()).unwrap();
        let b = m.ensure_files(Vec::<String>::new()).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
