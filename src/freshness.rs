//! Staleness check of a local file against the origin.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, LAST_MODIFIED};

use crate::fs::FileMeta;

/// Local and remote versions of one asset, built per check and then dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessDescriptor {
    /// Local size in bytes.
    pub local_size: u64,
    /// Local modification time.
    pub local_modified: Option<DateTime<Utc>>,
    /// Size reported by the origin.
    pub remote_size: u64,
    /// `Last-Modified` reported by the origin, when present and parseable.
    pub remote_modified: Option<DateTime<Utc>>,
}

impl FreshnessDescriptor {
    /// Returns true if the local copy must be downloaded again.
    ///
    /// A size mismatch always wins. A newer remote time only counts when both
    /// times are known.
    #[must_use]
    pub fn needs_download(&self) -> bool {
        if self.remote_size != self.local_size {
            return true;
        }
        matches!(
            (self.remote_modified, self.local_modified),
            (Some(remote), Some(local)) if remote > local
        )
    }
}

/// What the origin said about a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMeta {
    /// `Content-Length` of the full resource.
    pub size: Option<u64>,
    /// Parsed `Last-Modified`.
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteMeta {
    /// Returns true if this version replaces `local`.
    ///
    /// Without a size there is nothing to compare, and the local copy is kept.
    #[must_use]
    pub fn outdates(&self, local: FileMeta) -> bool {
        let Some(remote_size) = self.size else {
            return false;
        };
        FreshnessDescriptor {
            local_size: local.len,
            local_modified: local.modified.map(DateTime::<Utc>::from),
            remote_size,
            remote_modified: self.modified,
        }
        .needs_download()
    }
}

/// Parses an HTTP date such as `Wed, 21 Oct 2015 07:28:00 GMT`.
#[must_use]
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extracts size and modification time from a HEAD response.
///
/// `Content-Length` is read from the header itself because HEAD responses
/// carry no body to size.
#[must_use]
pub fn remote_meta(response: &reqwest::Response) -> RemoteMeta {
    let headers = response.headers();
    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let modified = headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);
    RemoteMeta { size, modified }
}

/// Issues a HEAD request for `url` and decides whether `local` is stale.
///
/// Fails open: an error, a non-success status, a missing size or no answer
/// within `timeout` all leave the local file in place.
pub async fn is_stale(
    client: &reqwest::Client,
    url: &str,
    local: FileMeta,
    timeout: Duration,
) -> bool {
    let response = match client.head(url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("freshness check for {url} failed, keeping local copy: {e}");
            return false;
        }
    };
    if !response.status().is_success() {
        log::warn!(
            "freshness check for {url} returned {}, keeping local copy",
            response.status()
        );
        return false;
    }

    let remote = remote_meta(&response);
    if remote.size.is_none() {
        log::debug!("freshness check for {url} has no size, keeping local copy");
        return false;
    }
    let stale = remote.outdates(local);
    if stale {
        log::info!("{url} is stale: local {local:?}, remote {remote:?}");
    }
    stale
}
