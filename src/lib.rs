//! media-fetch - a resumable, concurrency-bounded media download manager.
//!
//! Assets are addressed by key, a relative path that is both the local path
//! under the storage root and the remote path under the origin. The manager
//! makes sure a key exists locally and is fresh, resuming partial transfers
//! with range requests, retrying network failures with exponential backoff and
//! committing each file atomically.
//!
//! # Example
//!
//! ```no_run
//! use media_fetch::{Ensured, FetchConfig, FetchManager};
//!
//! # async fn example() -> media_fetch::Result<()> {
//! let config = FetchConfig::new("https://cdn.example.com/media", "/var/lib/app/media");
//! let manager = FetchManager::start(config).await?;
//!
//! // One file
//! match manager.ensure_file("scenes/intro.mp4").await? {
//!     Ensured::Fresh(path) => println!("ready: {}", path.display()),
//!     Ensured::Pending(done) => {
//!         let path = done.wait().await.map_err(|source| media_fetch::Error::Fetch {
//!             key: "scenes/intro.mp4".into(),
//!             source,
//!         })?;
//!         println!("downloaded: {}", path.display());
//!     }
//!     Ensured::InFlight => {}
//! }
//!
//! // A batch with aggregate progress
//! let mut batch = manager.ensure_files(["music/theme.ogg", "scenes/outro.mp4"])?;
//! while let Some(p) = batch.next_progress().await {
//!     println!("{}/{}", p.completed, p.total);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod batch;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod format;
pub mod freshness;
pub mod fs;
pub mod janitor;
pub mod layout;
pub mod reachability;
pub mod scheduler;
pub mod transfer;

// Re-export main types for convenience
pub use batch::Batch;
pub use config::FetchConfig;
pub use error::{Error, FetchError, Result};
pub use event::{BatchProgress, DownloadState, EventStream, FetchEvent};
pub use format::{format_bytes, format_duration, format_rate};
pub use fs::{FileMeta, FileSystem, TokioFileSystem};
pub use janitor::SweepReport;
pub use reachability::{AlwaysOnline, Reachability, ReachabilityFlag};
pub use scheduler::{Completion, Ensured, FetchManager, Outcome};
