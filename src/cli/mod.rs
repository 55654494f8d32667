//! CLI mode for media-fetch: ensure a list of keys as one batch.

mod progress;

use std::path::PathBuf;
use std::time::Instant;

use futures::{FutureExt, StreamExt};

use crate::{Error, FetchConfig, FetchError, FetchManager};

use progress::ProgressView;

/// Parsed command line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// TOML configuration file.
    pub config_path: Option<PathBuf>,
    /// Overrides `origin_base_url`.
    pub origin: Option<String>,
    /// Overrides `base_dir`.
    pub dir: Option<PathBuf>,
    /// Overrides `concurrency_cap`.
    pub concurrency: Option<usize>,
    /// Overrides `max_retries`.
    pub retries: Option<u32>,
    /// Keys to ensure, in order.
    pub keys: Vec<String>,
}

fn print_usage() {
    eprintln!("Usage: media-fetch [OPTIONS] <key>...");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <key>                 Relative path of an asset on the origin");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <FILE>   TOML configuration file");
    eprintln!("  -o, --origin <URL>    Origin base URL");
    eprintln!("  -d, --dir <DIR>       Local storage root");
    eprintln!("  -p, --concurrency <N> Simultaneous transfers");
    eprintln!("  -r, --retries <N>     Retries per key after a network failure");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG              Log filter (default: warn)");
}

fn option_value(args: &[String], i: usize, name: &str) -> crate::Result<String> {
    args.get(i)
        .cloned()
        .ok_or_else(|| Error::Config(format!("{name} needs a value")))
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{name} expects a number, got {value:?}")))
}

/// Parses arguments (without the program name). Returns `None` for `--help`.
///
/// # Errors
///
/// Returns [`Error::Config`] for unknown options, missing values or no keys.
pub fn parse_args<I>(args: I) -> crate::Result<Option<CliArgs>>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    let mut parsed = CliArgs::default();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-c" | "--config" => {
                i += 1;
                parsed.config_path = Some(PathBuf::from(option_value(&args, i, arg)?));
            }
            "-o" | "--origin" => {
                i += 1;
                parsed.origin = Some(option_value(&args, i, arg)?);
            }
            "-d" | "--dir" => {
                i += 1;
                parsed.dir = Some(PathBuf::from(option_value(&args, i, arg)?));
            }
            "-p" | "--concurrency" => {
                i += 1;
                parsed.concurrency = Some(parse_number(&option_value(&args, i, arg)?, arg)?);
            }
            "-r" | "--retries" => {
                i += 1;
                parsed.retries = Some(parse_number(&option_value(&args, i, arg)?, arg)?);
            }
            "-h" | "--help" => return Ok(None),
            key if !key.starts_with('-') => parsed.keys.push(key.to_string()),
            other => return Err(Error::Config(format!("unknown option: {other}"))),
        }
        i += 1;
    }

    if parsed.keys.is_empty() {
        return Err(Error::Config("no keys given".to_string()));
    }
    Ok(Some(parsed))
}

/// Builds the manager configuration: file first, then flags on top.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be loaded.
pub fn build_config(args: &CliArgs) -> crate::Result<FetchConfig> {
    let mut config = match &args.config_path {
        Some(path) => FetchConfig::load(path)?,
        None => FetchConfig::default(),
    };
    if let Some(origin) = &args.origin {
        config.origin_base_url.clone_from(origin);
    }
    if let Some(dir) = &args.dir {
        config.base_dir.clone_from(dir);
    }
    if let Some(cap) = args.concurrency {
        config.concurrency_cap = cap;
    }
    if let Some(retries) = args.retries {
        config.max_retries = retries;
    }
    Ok(config)
}

/// Entry point of the `media-fetch` binary.
///
/// # Errors
///
/// Returns an error for bad arguments or configuration, or
/// [`Error::Fetch`] naming the first key that failed.
pub async fn run() -> crate::Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print_usage();
            return Ok(());
        }
        Err(e) => {
            print_usage();
            return Err(e);
        }
    };
    let config = build_config(&args)?;
    let manager = FetchManager::start(config).await?;

    let mut events = manager.subscribe();
    let batch = manager.ensure_files(args.keys)?;
    let mut view = ProgressView::new(batch.id(), batch.total());
    let started = Instant::now();

    let wait = batch.wait();
    tokio::pin!(wait);
    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            Some(event) = events.next() => view.apply(event),
        }
    };
    // Terminal events of the last key may still be buffered.
    while let Some(Some(event)) = events.next().now_or_never() {
        view.apply(event);
    }
    view.finish(started.elapsed(), manager.config());

    result.map_err(|e| match e {
        FetchError::BatchPartialFailure { key, source } => Error::Fetch {
            key,
            source: *source,
        },
        other => Error::Fetch {
            key: String::new(),
            source: other,
        },
    })
}
