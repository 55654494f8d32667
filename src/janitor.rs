//! Startup sweep of abandoned `.temp` files.
//!
//! Young `.temp` files are kept because the next request for the same key
//! resumes from them. A worker rewrites its file continuously, so age alone
//! tells an abandoned file from a live one.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::layout::TEMP_SUFFIX;

/// What a sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// `.temp` files deleted for being older than the threshold.
    pub removed: usize,
    /// `.temp` files kept for resume.
    pub kept: usize,
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(TEMP_SUFFIX))
}

/// Recursively deletes `.temp` files under `root` older than `max_age`.
///
/// A missing root is an empty sweep. Unreadable subdirectories and files that
/// cannot be removed are logged and skipped.
///
/// # Errors
///
/// Returns an error only if `root` exists but cannot be read.
pub async fn sweep(root: &Path, max_age: Duration) -> std::io::Result<SweepReport> {
    let mut report = SweepReport::default();
    let mut dirs: Vec<PathBuf> = Vec::new();

    match tokio::fs::read_dir(root).await {
        Ok(_) => dirs.push(root.to_path_buf()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e),
    }

    let now = SystemTime::now();
    while let Some(dir) = dirs.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cannot scan {}: {e}", dir.display());
                continue;
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                dirs.push(path);
                continue;
            }
            if !file_type.is_file() || !is_temp_file(&path) {
                continue;
            }

            let age = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age <= max_age {
                log::debug!("keeping {} for resume", path.display());
                report.kept += 1;
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    log::info!("removed abandoned {}", path.display());
                    report.removed += 1;
                }
                Err(e) => log::warn!("cannot remove {}: {e}", path.display()),
            }
        }
    }
    Ok(report)
}
