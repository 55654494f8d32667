//! Progress bars and summary for CLI batches.

use std::collections::HashMap;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::{DownloadState, FetchConfig, FetchEvent, format_duration};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";
/// Bar resolution for fractional progress.
const STEPS: u64 = 1000;

fn style_or_default(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("━━╌"))
}

fn make_file_bar(key: &str) -> ProgressBar {
    let bar = ProgressBar::new(STEPS);
    bar.set_style(style_or_default(
        "{spinner:.cyan} [{bar:40.cyan/blue}] {percent:>3}% - {msg}",
    ));
    bar.set_message(key.to_string());
    bar.enable_steady_tick(Duration::from_millis(250));
    bar
}

fn make_total_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(style_or_default(
        "Files [{bar:40.green/white}] {pos}/{len} ({elapsed})",
    ));
    bar
}

/// Renders the event stream of one batch.
pub struct ProgressView {
    batch: u64,
    multi: MultiProgress,
    total_bar: ProgressBar,
    bars: HashMap<String, ProgressBar>,
    downloaded: usize,
    up_to_date: usize,
    retries: usize,
    failed: Vec<(String, String)>,
}

impl ProgressView {
    pub fn new(batch: u64, total: usize) -> Self {
        let multi = MultiProgress::new();
        let total_bar = multi.add(make_total_bar(total));
        Self {
            batch,
            multi,
            total_bar,
            bars: HashMap::new(),
            downloaded: 0,
            up_to_date: 0,
            retries: 0,
            failed: Vec::new(),
        }
    }

    fn bar(&mut self, key: &str) -> &ProgressBar {
        if !self.bars.contains_key(key) {
            let bar = self.multi.insert_before(&self.total_bar, make_file_bar(key));
            self.bars.insert(key.to_string(), bar);
        }
        &self.bars[key]
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn apply(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::StateChanged {
                key,
                state: DownloadState::Transferring,
            } => {
                self.bar(&key).set_message(key.clone());
            }
            FetchEvent::StateChanged { .. } => {}
            FetchEvent::Progress { key, fraction } => {
                self.bar(&key)
                    .set_position((fraction.clamp(0.0, 1.0) * STEPS as f64) as u64);
            }
            FetchEvent::Retry {
                key,
                attempt,
                delay,
                message,
            } => {
                self.retries += 1;
                self.bar(&key).set_message(format!(
                    "{key} (retry {attempt} in {}: {message})",
                    format_duration(delay)
                ));
            }
            FetchEvent::Complete { key } => match self.bars.remove(&key) {
                Some(bar) => {
                    bar.finish_and_clear();
                    self.downloaded += 1;
                    let _ = self.multi.println(format!("  {} {key}", style("✓").green()));
                }
                None => self.up_to_date += 1,
            },
            FetchEvent::Error { key, message } => {
                if let Some(bar) = self.bars.remove(&key) {
                    bar.abandon_with_message(format!("{key}: {message}"));
                }
                self.failed.push((key, message));
            }
            FetchEvent::Cancelled { key } => {
                if let Some(bar) = self.bars.remove(&key) {
                    bar.abandon_with_message(format!("{key}: cancelled"));
                }
            }
            FetchEvent::BatchProgress(update) if update.batch == self.batch => {
                self.total_bar.set_position(update.completed as u64);
            }
            FetchEvent::BatchProgress(_) => {}
        }
    }

    /// Clears the bars and prints what happened.
    pub fn finish(self, elapsed: Duration, config: &FetchConfig) {
        for bar in self.bars.values() {
            bar.finish_and_clear();
        }
        self.total_bar.finish_and_clear();

        println!("\n{SEPARATOR}");
        println!("Fetch Summary");
        println!("{SEPARATOR}");
        println!("  Storage root:      {}", config.base_dir.display());
        println!("  Downloaded:        {}", self.downloaded);
        println!("  Already fresh:     {}", self.up_to_date);
        if self.retries > 0 {
            println!("  Retries:           {}", self.retries);
        }
        println!("  Total time:        {}", format_duration(elapsed));
        for (key, message) in &self.failed {
            println!("  {} {key}: {message}", style("✗").red());
        }
        println!("{SEPARATOR}");
    }
}
