//! Transfer worker: one request, from the first byte (or the resume offset)
//! to the atomic rename into place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::event::DownloadState;
use crate::format::{format_bytes, format_duration, format_rate};
use crate::fs::FileSystem;
use crate::reachability::Reachability;

/// Trait for receiving transfer updates.
///
/// All methods have default no-op implementations for convenience.
pub trait TransferProgress: Send + Sync {
    /// Called when the request changes state.
    fn on_state(&self, _key: &str, _state: DownloadState) {}

    /// Called with the completed fraction, throttled.
    fn on_progress(&self, _key: &str, _fraction: f64) {}

    /// Called before sleeping out a backoff delay.
    fn on_retry(&self, _key: &str, _attempt: u32, _delay: Duration, _error: &FetchError) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl TransferProgress for NoProgress {}

/// Where one key comes from and goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Logical key, used for events and logs.
    pub key: String,
    /// Fully encoded origin URL.
    pub url: String,
    /// Final destination.
    pub final_path: PathBuf,
    /// In-progress sibling of `final_path`.
    pub temp_path: PathBuf,
}

/// Exponential backoff for network failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Returns the delay after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Returns true if a retryable failure of `attempt` may be retried.
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

/// Suppresses progress updates smaller than `step`.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    step: f64,
    last: Option<f64>,
}

impl ProgressThrottle {
    /// Creates a throttle with the given minimum step.
    #[must_use]
    pub const fn new(step: f64) -> Self {
        Self { step, last: None }
    }

    /// Returns the fraction to report for `done` of `total` bytes, if any.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn update(&mut self, done: u64, total: u64) -> Option<f64> {
        if total == 0 {
            return None;
        }
        let fraction = (done as f64 / total as f64).clamp(0.0, 1.0);
        let due = match self.last {
            None => true,
            Some(last) => fraction - last >= self.step || (fraction >= 1.0 && last < 1.0),
        };
        if due {
            self.last = Some(fraction);
            Some(fraction)
        } else {
            None
        }
    }

    /// Returns `1.0` unless it was already reported.
    #[must_use]
    pub fn finish(&mut self) -> Option<f64> {
        if self.last.is_some_and(|last| last >= 1.0) {
            None
        } else {
            self.last = Some(1.0);
            Some(1.0)
        }
    }
}

/// Parses `Content-Range: bytes <start>-<end>/<total>` into `(start, total)`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = total.trim().parse().ok();
    Some((start, total))
}

/// Bytes on disk when one attempt finished.
struct AttemptOutcome {
    resumed_from: u64,
    bytes: u64,
}

/// Performs transfers for the manager.
pub struct TransferWorker {
    client: reqwest::Client,
    fs: Arc<dyn FileSystem>,
    reachability: Arc<dyn Reachability>,
    policy: RetryPolicy,
    cleanup_on_error: bool,
    progress_step: f64,
}

impl TransferWorker {
    /// Creates a worker sharing the manager's client and file system.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        fs: Arc<dyn FileSystem>,
        reachability: Arc<dyn Reachability>,
        policy: RetryPolicy,
        cleanup_on_error: bool,
        progress_step: f64,
    ) -> Self {
        Self {
            client,
            fs,
            reachability,
            policy,
            cleanup_on_error,
            progress_step,
        }
    }

    /// Runs the request to a terminal outcome.
    ///
    /// Network failures are retried with backoff and keep the `.temp` file so
    /// the next attempt resumes. Cancellation keeps it too. Other failures are
    /// final and remove it.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`FetchError`] for the request.
    pub async fn run(
        &self,
        request: &TransferRequest,
        progress: &dyn TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        if !self.reachability.is_online() {
            log::warn!("{}: network unavailable, not starting", request.key);
            return Err(FetchError::NetworkUnavailable);
        }
        if let Some(parent) = request
            .final_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            self.fs.create_dir_all(parent).await?;
        }

        let started = Instant::now();
        let mut attempt = 1;
        loop {
            progress.on_state(&request.key, DownloadState::Transferring);

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(FetchError::Cancelled),
                res = self.attempt(request, progress) => res,
            };

            let error = match result {
                Ok(outcome) => match self.verify_length(request, &outcome).await {
                    Err(e) => e,
                    Ok(()) => {
                        if let Err(e) = self.commit(request).await {
                            log::error!("{}: commit failed: {e}", request.key);
                            self.discard_temp(&request.temp_path).await;
                            return Err(e);
                        }
                        let elapsed = started.elapsed();
                        log::info!(
                            "{}: committed {} (resumed from {}) in {} at {} after {attempt} attempt(s)",
                            request.key,
                            format_bytes(outcome.bytes),
                            format_bytes(outcome.resumed_from),
                            format_duration(elapsed),
                            format_rate(outcome.bytes.saturating_sub(outcome.resumed_from), elapsed),
                        );
                        return Ok(());
                    }
                },
                Err(FetchError::Cancelled) => {
                    log::info!("{}: cancelled, keeping partial file", request.key);
                    return Err(FetchError::Cancelled);
                }
                Err(e) => e,
            };

            if error.is_retryable() && self.policy.allows_retry(attempt) {
                let delay = self.policy.delay_for(attempt);
                log::warn!(
                    "{}: attempt {attempt} failed ({error}), retrying in {}",
                    request.key,
                    format_duration(delay)
                );
                progress.on_retry(&request.key, attempt, delay, &error);
                progress.on_state(&request.key, DownloadState::Retrying);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        log::info!("{}: cancelled during backoff", request.key);
                        return Err(FetchError::Cancelled);
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
                continue;
            }

            if !error.is_retryable() || self.cleanup_on_error {
                self.discard_temp(&request.temp_path).await;
            }
            log::error!(
                "{}: giving up after {attempt} attempt(s): {error}",
                request.key
            );
            return Err(error);
        }
    }

    /// One GET, appended to or replacing the `.temp` file.
    async fn attempt(
        &self,
        request: &TransferRequest,
        progress: &dyn TransferProgress,
    ) -> Result<AttemptOutcome, FetchError> {
        let (mut response, offset) = loop {
            let offset = self.fs.file_size(&request.temp_path).await.unwrap_or(0);
            let mut builder = self.client.get(&request.url);
            if offset > 0 {
                log::debug!("{}: resuming at byte {offset}", request.key);
                builder = builder.header(RANGE, format!("bytes={offset}-"));
            }
            let response = builder.send().await?;
            if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
                log::warn!(
                    "{}: origin rejected resume at {offset}, restarting",
                    request.key
                );
                self.fs.remove_file(&request.temp_path).await?;
                continue;
            }
            break (response, offset);
        };

        let status = response.status();
        let (append, start, total) = if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            let range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            if let Some((start, _)) = range
                && start != offset
            {
                self.fs.remove_file(&request.temp_path).await?;
                return Err(FetchError::Connection(format!(
                    "origin resumed at byte {start}, expected {offset}"
                )));
            }
            let total = range
                .and_then(|(_, total)| total)
                .or_else(|| response.content_length().map(|len| offset + len));
            (true, offset, total)
        } else if status.is_success() {
            if offset > 0 {
                log::debug!(
                    "{}: origin ignored range, discarding {offset} partial bytes",
                    request.key
                );
            }
            (false, 0, response.content_length())
        } else {
            return Err(FetchError::UnexpectedStatus(status.as_u16()));
        };

        let mut writer = self.fs.open_write(&request.temp_path, append).await?;
        let mut throttle = ProgressThrottle::new(self.progress_step);
        let mut written = start;
        if let Some(fraction) = total.and_then(|t| throttle.update(written, t)) {
            progress.on_progress(&request.key, fraction);
        }

        while let Some(chunk) = response.chunk().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(fraction) = total.and_then(|t| throttle.update(written, t)) {
                progress.on_progress(&request.key, fraction);
            }
        }
        writer.flush().await?;
        writer.shutdown().await?;
        drop(writer);

        if let Some(total) = total
            && written != total
        {
            return Err(FetchError::Connection(format!(
                "body ended at byte {written} of {total}"
            )));
        }
        if throttle.finish().is_some() {
            progress.on_progress(&request.key, 1.0);
        }
        Ok(AttemptOutcome {
            resumed_from: start,
            bytes: written,
        })
    }

    /// Checks that the `.temp` file holds exactly the bytes the attempt wrote.
    ///
    /// A write still in flight from an earlier, dropped writer can land after
    /// the resume offset was read and shift the file. Such a file is discarded.
    async fn verify_length(
        &self,
        request: &TransferRequest,
        outcome: &AttemptOutcome,
    ) -> Result<(), FetchError> {
        let on_disk = self.fs.file_size(&request.temp_path).await.unwrap_or(0);
        if on_disk == outcome.bytes {
            return Ok(());
        }
        log::warn!(
            "{}: temp file holds {on_disk} bytes, expected {}, discarding",
            request.key,
            outcome.bytes
        );
        self.discard_temp(&request.temp_path).await;
        Err(FetchError::Connection(format!(
            "temp file holds {on_disk} bytes, expected {}",
            outcome.bytes
        )))
    }

    /// Replaces the final file with the finished `.temp` file.
    async fn commit(&self, request: &TransferRequest) -> Result<(), FetchError> {
        if self.fs.file_exists(&request.final_path).await {
            self.fs.remove_file(&request.final_path).await?;
        }
        self.fs
            .rename_file(&request.temp_path, &request.final_path)
            .await?;
        Ok(())
    }

    async fn discard_temp(&self, temp_path: &Path) {
        if let Err(e) = self.fs.remove_file(temp_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!("could not remove {}: {e}", temp_path.display());
        }
    }
}
