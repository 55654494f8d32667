//! Configuration types for fetch operations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the fetch manager.
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Maximum number of simultaneous transfers.
    pub concurrency_cap: usize,
    /// Retries after the first attempt for connection errors and timeouts.
    pub max_retries: u32,
    /// Base of the exponential backoff, in seconds.
    pub retry_base_delay_secs: f64,
    /// Network timeout for one attempt, in seconds.
    pub per_attempt_timeout_secs: u64,
    /// TCP connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Origin that keys are resolved against, e.g. `https://cdn.example.com/media`.
    pub origin_base_url: String,
    /// Local storage root that keys are resolved against.
    pub base_dir: PathBuf,
    /// `.temp` files older than this are removed by the startup sweep.
    pub temp_max_age_secs: u64,
    /// Whether present files are checked against the origin with a HEAD request.
    pub check_freshness: bool,
    /// Timeout of the freshness HEAD request, in milliseconds.
    pub freshness_timeout_ms: u64,
    /// Whether a `.temp` file is removed once retries are exhausted.
    pub cleanup_on_error: bool,
    /// Delay between starting consecutive keys of a batch, in milliseconds.
    pub batch_stagger_ms: u64,
    /// Whether the first failure in a batch cancels the transfers it started.
    pub cancel_batch_on_failure: bool,
    /// Minimum change in fraction between two progress events.
    pub progress_step: f64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            concurrency_cap: 3,
            max_retries: 3,
            retry_base_delay_secs: 2.0,
            per_attempt_timeout_secs: 30 * 60,
            connect_timeout_secs: 30,
            origin_base_url: String::new(),
            base_dir: data_dir.join("media-fetch"),
            temp_max_age_secs: 60 * 60,
            check_freshness: true,
            freshness_timeout_ms: 10_000,
            cleanup_on_error: true,
            batch_stagger_ms: 100,
            cancel_batch_on_failure: false,
            progress_step: 0.01,
            event_capacity: 256,
        }
    }
}

impl FetchConfig {
    /// Creates a new configuration for the given origin and storage root.
    #[must_use]
    pub fn new(origin_base_url: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            origin_base_url: origin_base_url.into(),
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the text is not valid TOML for this type.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Checks the values the manager cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_cap == 0 {
            return Err(Error::Config("concurrency_cap must be at least 1".into()));
        }
        let origin = self.origin_base_url.trim();
        if origin.is_empty() {
            return Err(Error::Config("origin_base_url is not set".into()));
        }
        if !(origin.starts_with("http://") || origin.starts_with("https://")) {
            return Err(Error::Config(format!(
                "origin_base_url must be http(s): {origin}"
            )));
        }
        if self.per_attempt_timeout_secs == 0 {
            return Err(Error::Config(
                "per_attempt_timeout_secs must be at least 1".into(),
            ));
        }
        if self.freshness_timeout_ms == 0 {
            return Err(Error::Config("freshness_timeout_ms must be at least 1".into()));
        }
        if !self.retry_base_delay_secs.is_finite() || self.retry_base_delay_secs < 0.0 {
            return Err(Error::Config(
                "retry_base_delay_secs must be a non-negative number".into(),
            ));
        }
        if !(self.progress_step > 0.0 && self.progress_step <= 1.0) {
            return Err(Error::Config("progress_step must be in (0, 1]".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Sets the maximum number of simultaneous transfers.
    #[must_use]
    pub const fn with_concurrency_cap(mut self, cap: usize) -> Self {
        self.concurrency_cap = cap;
        self
    }

    /// Sets the number of retries for network failures.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the backoff base.
    #[must_use]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_secs = delay.as_secs_f64();
        self
    }

    /// Sets the per-attempt network timeout.
    #[must_use]
    pub const fn with_per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the age after which abandoned `.temp` files are removed.
    #[must_use]
    pub const fn with_temp_max_age(mut self, age: Duration) -> Self {
        self.temp_max_age_secs = age.as_secs();
        self
    }

    /// Sets whether present files are checked for freshness.
    #[must_use]
    pub const fn with_check_freshness(mut self, check: bool) -> Self {
        self.check_freshness = check;
        self
    }

    /// Sets the timeout of the freshness HEAD request.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_freshness_timeout(mut self, timeout: Duration) -> Self {
        self.freshness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets whether `.temp` files are removed once retries are exhausted.
    #[must_use]
    pub const fn with_cleanup_on_error(mut self, cleanup: bool) -> Self {
        self.cleanup_on_error = cleanup;
        self
    }

    /// Sets the delay between batch members.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_batch_stagger(mut self, stagger: Duration) -> Self {
        self.batch_stagger_ms = stagger.as_millis() as u64;
        self
    }

    /// Sets whether a batch failure cancels its siblings.
    #[must_use]
    pub const fn with_cancel_batch_on_failure(mut self, cancel: bool) -> Self {
        self.cancel_batch_on_failure = cancel;
        self
    }

    /// Sets the progress throttle step.
    #[must_use]
    pub const fn with_progress_step(mut self, step: f64) -> Self {
        self.progress_step = step;
        self
    }

    /// Returns the backoff base as a [`Duration`].
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_base_delay_secs).unwrap_or(Duration::ZERO)
    }

    /// Returns the per-attempt timeout as a [`Duration`].
    #[must_use]
    pub const fn per_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.per_attempt_timeout_secs)
    }

    /// Returns the connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns the freshness request timeout as a [`Duration`].
    #[must_use]
    pub const fn freshness_timeout(&self) -> Duration {
        Duration::from_millis(self.freshness_timeout_ms)
    }

    /// Returns the janitor threshold as a [`Duration`].
    #[must_use]
    pub const fn temp_max_age(&self) -> Duration {
        Duration::from_secs(self.temp_max_age_secs)
    }

    /// Returns the batch stagger as a [`Duration`].
    #[must_use]
    pub const fn batch_stagger(&self) -> Duration {
        Duration::from_millis(self.batch_stagger_ms)
    }
}
