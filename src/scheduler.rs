//! The fetch manager: admission, the concurrency cap, the FIFO queue and
//! cancellation, all behind one state table.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::event::{DownloadState, EventStream, FetchEvent};
use crate::freshness;
use crate::fs::{FileSystem, TokioFileSystem};
use crate::janitor::{self, SweepReport};
use crate::layout;
use crate::reachability::{AlwaysOnline, Reachability};
use crate::transfer::{RetryPolicy, TransferProgress, TransferRequest, TransferWorker};

/// Terminal result handed to everyone waiting on a key.
pub type Outcome = std::result::Result<PathBuf, FetchError>;

/// Result of [`FetchManager::ensure_file`].
#[derive(Debug)]
pub enum Ensured {
    /// The local file is present and fresh; nothing was transferred.
    Fresh(PathBuf),
    /// A transfer was started or queued; await the completion. When the
    /// network is unavailable the completion has already resolved to
    /// [`FetchError::NetworkUnavailable`].
    Pending(Completion),
    /// The key is already in flight. This call did nothing; use
    /// [`FetchManager::watch`] to observe the original request.
    InFlight,
}

impl Ensured {
    /// Returns true on the fast path.
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

/// Resolves once the transfer of one key reaches a terminal state.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    /// Waits for the final path or the terminal error.
    ///
    /// # Errors
    ///
    /// Returns the transfer's [`FetchError`].
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Err(FetchError::Cancelled))
    }
}

/// One admitted key.
struct Entry {
    state: DownloadState,
    cancel: CancellationToken,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

/// Everything admission, completion and cancellation mutate.
#[derive(Default)]
struct Table {
    active: usize,
    entries: HashMap<String, Entry>,
    queue: VecDeque<TransferRequest>,
}

struct Inner {
    config: FetchConfig,
    client: reqwest::Client,
    fs: Arc<dyn FileSystem>,
    reachability: Arc<dyn Reachability>,
    worker: TransferWorker,
    table: Mutex<Table>,
    events: broadcast::Sender<FetchEvent>,
    next_batch: AtomicU64,
}

/// Handle to the download service.
///
/// Construct it once at startup and clone the handle into every collaborator.
/// Clones share the same queue, cap and event stream.
#[derive(Clone)]
pub struct FetchManager {
    inner: Arc<Inner>,
}

impl FetchManager {
    /// Creates a manager backed by the real file system and network.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.per_attempt_timeout())
            .connect_timeout(config.connect_timeout())
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Self::with_parts(
            config,
            client,
            Arc::new(TokioFileSystem),
            Arc::new(AlwaysOnline),
        )
    }

    /// Creates a manager from explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_parts(
        config: FetchConfig,
        client: reqwest::Client,
        fs: Arc<dyn FileSystem>,
        reachability: Arc<dyn Reachability>,
    ) -> Result<Self> {
        config.validate()?;
        let worker = TransferWorker::new(
            client.clone(),
            Arc::clone(&fs),
            Arc::clone(&reachability),
            RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.retry_base_delay(),
            },
            config.cleanup_on_error,
            config.progress_step,
        );
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                fs,
                reachability,
                worker,
                table: Mutex::new(Table::default()),
                events,
                next_batch: AtomicU64::new(1),
            }),
        })
    }

    /// Creates a manager and sweeps abandoned `.temp` files once.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager cannot be created. Sweep failures are
    /// logged only.
    pub async fn start(config: FetchConfig) -> Result<Self> {
        let manager = Self::new(config)?;
        if let Err(e) = manager.sweep_temp_files().await {
            log::warn!("temp file sweep failed: {e}");
        }
        Ok(manager)
    }

    /// Returns the configuration in use.
    #[must_use]
    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Removes `.temp` files older than the configured age under the storage root.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be read.
    pub async fn sweep_temp_files(&self) -> std::io::Result<SweepReport> {
        janitor::sweep(&self.inner.config.base_dir, self.inner.config.temp_max_age()).await
    }

    /// Subscribes to every event.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe(), None)
    }

    /// Subscribes to the events of one key.
    #[must_use]
    pub fn progress_stream(&self, key: &str) -> EventStream {
        EventStream::new(self.inner.events.subscribe(), Some(key.to_string()))
    }

    /// Makes sure `key` exists locally and is fresh.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidKey`] if the key is not a safe relative path.
    pub async fn ensure_file(&self, key: &str) -> Result<Ensured> {
        self.ensure_file_with_token(key, CancellationToken::new()).await
    }

    /// Like [`ensure_file`](Self::ensure_file), cancellable through `cancel`.
    ///
    /// While offline a present file is kept without asking the origin, and a
    /// missing or stale one fails at once without taking a slot. The token is honoured once the request holds a transfer slot; use
    /// [`cancel_download`](Self::cancel_download) to drop a queued request at once.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidKey`] if the key is not a safe relative path.
    pub async fn ensure_file_with_token(
        &self,
        key: &str,
        cancel: CancellationToken,
    ) -> Result<Ensured> {
        layout::validate_key(key)?;
        if self.is_downloading(key) {
            log::debug!("{key}: already in flight");
            return Ok(Ensured::InFlight);
        }

        let config = &self.inner.config;
        let final_path = layout::local_path(&config.base_dir, key);
        let url = layout::remote_url(&config.origin_base_url, key);

        let online = self.inner.reachability.is_online();
        if let Some(meta) = self.inner.fs.metadata(&final_path).await {
            let stale = online
                && config.check_freshness
                && freshness::is_stale(&self.inner.client, &url, meta, config.freshness_timeout())
                    .await;
            if !stale {
                log::debug!("{key}: present and fresh");
                self.inner.emit(FetchEvent::Complete {
                    key: key.to_string(),
                });
                return Ok(Ensured::Fresh(final_path));
            }
        }

        if !online {
            log::warn!("{key}: network unavailable, not queueing");
            let completion = self.inner.fail_now(key, FetchError::NetworkUnavailable);
            return Ok(Ensured::Pending(completion));
        }

        let request = TransferRequest {
            key: key.to_string(),
            url,
            temp_path: layout::temp_path(&final_path),
            final_path,
        };
        Ok(self.inner.admit(request, cancel))
    }

    /// Attaches to the in-flight transfer of `key`, if there is one.
    #[must_use]
    pub fn watch(&self, key: &str) -> Option<Completion> {
        let mut table = self.inner.table();
        let entry = table.entries.get_mut(key)?;
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        Some(Completion { rx })
    }

    /// Returns true while `key` is queued or transferring.
    #[must_use]
    pub fn is_downloading(&self, key: &str) -> bool {
        self.inner.table().entries.contains_key(key)
    }

    /// Returns the state of a key while it is admitted.
    ///
    /// The entry is dropped on a terminal outcome, so this returns `None`
    /// afterwards. `Succeeded` and `Failed` are only seen through
    /// [`FetchEvent::StateChanged`].
    #[must_use]
    pub fn state(&self, key: &str) -> Option<DownloadState> {
        self.inner.table().entries.get(key).map(|e| e.state)
    }

    /// Returns the number of transfers holding a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.table().active
    }

    /// Returns the number of requests waiting for a slot.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.inner.table().queue.len()
    }

    /// Cancels `key`. Returns false if it was not in flight.
    ///
    /// A queued request is dropped at once. An active one stops its HTTP
    /// operation; its slot is released when the worker exits. The `.temp`
    /// file is kept for a later resume either way.
    pub fn cancel_download(&self, key: &str) -> bool {
        let mut table = self.inner.table();
        let Some(entry) = table.entries.get(key) else {
            return false;
        };
        entry.cancel.cancel();

        if let Some(pos) = table.queue.iter().position(|r| r.key == key) {
            table.queue.remove(pos);
            if let Some(entry) = table.entries.remove(key) {
                log::info!("{key}: cancelled while queued");
                self.inner.resolve(key, entry, Err(FetchError::Cancelled));
            }
        }
        true
    }

    pub(crate) fn next_batch_id(&self) -> u64 {
        self.inner.next_batch.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: FetchEvent) {
        self.inner.emit(event);
    }
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: FetchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn admit(self: &Arc<Self>, request: TransferRequest, cancel: CancellationToken) -> Ensured {
        let mut table = self.table();
        if table.entries.contains_key(&request.key) {
            return Ensured::InFlight;
        }
        let (tx, rx) = oneshot::channel();
        table.entries.insert(
            request.key.clone(),
            Entry {
                state: DownloadState::Queued,
                cancel: cancel.clone(),
                waiters: vec![tx],
            },
        );
        self.emit(FetchEvent::StateChanged {
            key: request.key.clone(),
            state: DownloadState::Queued,
        });

        if table.active < self.config.concurrency_cap {
            table.active += 1;
            log::debug!("{}: admitted ({} active)", request.key, table.active);
            self.spawn_worker(request, cancel);
        } else {
            log::debug!(
                "{}: queued behind {} request(s)",
                request.key,
                table.queue.len()
            );
            table.queue.push_back(request);
        }
        Ensured::Pending(Completion { rx })
    }

    fn spawn_worker(self: &Arc<Self>, request: TransferRequest, cancel: CancellationToken) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.worker.run(&request, &*inner, &cancel).await;
            inner.finish(request, result);
        });
    }

    /// Releases the slot of a finished worker and admits the next queued request.
    fn finish(self: &Arc<Self>, request: TransferRequest, result: std::result::Result<(), FetchError>) {
        let mut table = self.table();
        table.active = table.active.saturating_sub(1);
        if let Some(entry) = table.entries.remove(&request.key) {
            self.resolve(&request.key, entry, result.map(|()| request.final_path));
        }

        while table.active < self.config.concurrency_cap {
            let Some(next) = table.queue.pop_front() else {
                break;
            };
            let Some(cancel) = table.entries.get(&next.key).map(|e| e.cancel.clone()) else {
                continue;
            };
            table.active += 1;
            log::debug!("{}: dequeued ({} active)", next.key, table.active);
            self.spawn_worker(next, cancel);
        }
    }

    /// Resolves a request that never reached the table.
    fn fail_now(&self, key: &str, error: FetchError) -> Completion {
        let (tx, rx) = oneshot::channel();
        let entry = Entry {
            state: DownloadState::Failed,
            cancel: CancellationToken::new(),
            waiters: vec![tx],
        };
        self.resolve(key, entry, Err(error));
        Completion { rx }
    }

    /// Publishes the terminal outcome of `key` to events and waiters.
    fn resolve(&self, key: &str, entry: Entry, outcome: Outcome) {
        let key = key.to_string();
        let (state, event) = match &outcome {
            Ok(_) => (DownloadState::Succeeded, FetchEvent::Complete { key: key.clone() }),
            Err(FetchError::Cancelled) => {
                (DownloadState::Failed, FetchEvent::Cancelled { key: key.clone() })
            }
            Err(e) => (
                DownloadState::Failed,
                FetchEvent::Error {
                    key: key.clone(),
                    message: e.to_string(),
                },
            ),
        };
        self.emit(FetchEvent::StateChanged { key, state });
        self.emit(event);
        for waiter in entry.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl TransferProgress for Inner {
    fn on_state(&self, key: &str, state: DownloadState) {
        if let Some(entry) = self.table().entries.get_mut(key) {
            entry.state = state;
        }
        self.emit(FetchEvent::StateChanged {
            key: key.to_string(),
            state,
        });
    }

    fn on_progress(&self, key: &str, fraction: f64) {
        self.emit(FetchEvent::Progress {
            key: key.to_string(),
            fraction,
        });
    }

    fn on_retry(&self, key: &str, attempt: u32, delay: Duration, error: &FetchError) {
        self.emit(FetchEvent::Retry {
            key: key.to_string(),
            attempt,
            delay,
            message: error.to_string(),
        });
    }
}
