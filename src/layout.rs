//! Mapping from keys to local paths and origin URLs.
//!
//! A key is a relative path such as `scenes/intro/clip 01.mp4`. It doubles as
//! the relative file path under the storage root and as the relative URL path
//! under the origin.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Suffix of the in-progress sibling of a final file.
pub const TEMP_SUFFIX: &str = ".temp";

/// Checks that `key` is a non-empty relative path that stays inside the root.
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] describing the first problem found.
pub fn validate_key(key: &str) -> Result<()> {
    let invalid = |reason| Error::InvalidKey {
        key: key.to_string(),
        reason,
    };
    if key.trim().is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.starts_with('/') || key.starts_with('\\') || Path::new(key).is_absolute() {
        return Err(invalid("key must be relative"));
    }
    if key.ends_with(TEMP_SUFFIX) {
        return Err(invalid("key uses the reserved .temp suffix"));
    }
    for segment in key.split(['/', '\\']) {
        match segment {
            "" => return Err(invalid("key has an empty path segment")),
            "." | ".." => return Err(invalid("key must not contain . or .. segments")),
            _ => {}
        }
    }
    Ok(())
}

/// Returns `<base_dir>/<key>`.
#[must_use]
pub fn local_path(base_dir: &Path, key: &str) -> PathBuf {
    key.split('/')
        .fold(base_dir.to_path_buf(), |path, segment| path.join(segment))
}

/// Returns the `.temp` sibling of a final path.
#[must_use]
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Returns `<origin>/<key>` with each path segment percent-encoded.
///
/// Separators are kept so the origin sees the same directory structure.
#[must_use]
pub fn remote_url(origin_base_url: &str, key: &str) -> String {
    let encoded: Vec<_> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!(
        "{}/{}",
        origin_base_url.trim_end_matches('/'),
        encoded.join("/")
    )
}
