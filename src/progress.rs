//! Transfer progress reporting
//!
//! Download workers push a `ChunkTick` after every buffer they write. Sinks
//! must be cheap and must not block; the terminal bar below only bumps an
//! indicatif counter.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Progress of one chunk copy step.
#[derive(Debug, Clone, Copy)]
pub struct ChunkTick<'a> {
    pub local_path: &'a Path,
    /// Bytes written since the previous tick for this chunk. Zero when the
    /// chunk was abandoned.
    pub bytes: u64,
    /// Time since the chunk copy started.
    pub elapsed: Duration,
    pub chunk_length: u32,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, tick: &ChunkTick<'_>);
}

pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _tick: &ChunkTick<'_>) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&ChunkTick<'_>) + Send + Sync,
{
    fn report(&self, tick: &ChunkTick<'_>) {
        self(tick)
    }
}

/// Run-wide counters shared by all download workers.
#[derive(Debug)]
pub struct TransferStats {
    bytes: AtomicU64,
    chunks: AtomicU64,
    files: AtomicU64,
    started: Instant,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            files: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Undo bytes of a chunk that has to be fetched again.
    pub fn sub_bytes(&self, n: u64) {
        self.bytes.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn chunk_done(&self) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_done(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub bytes: u64,
    pub chunks: u64,
    pub files: u64,
    pub elapsed_secs: f64,
}

impl StatsSnapshot {
    /// Average bytes per second over the run.
    pub fn speed(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.bytes as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

/// Terminal byte counter for the download phase.
pub struct ByteProgress {
    bar: ProgressBar,
}

impl ByteProgress {
    pub fn new(total_bytes: u64, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(total_bytes)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    /// Print a line above the bar without tearing it.
    pub fn println(&self, line: &str) {
        self.bar.suspend(|| println!("{line}"));
    }
}

impl ProgressSink for ByteProgress {
    fn report(&self, tick: &ChunkTick<'_>) {
        if tick.bytes == 0 {
            return;
        }
        self.bar.inc(tick.bytes);
        if let Some(name) = tick.local_path.file_name() {
            self.bar.set_message(name.to_string_lossy().into_owned());
        }
    }
}

/// Spinner shown while a phase without byte totals runs.
pub struct PhaseSpinner {
    spinner: ProgressBar,
    start_time: Instant,
}

impl PhaseSpinner {
    pub fn new(msg: &str, visible: bool) -> Self {
        let spinner = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(msg.to_string());
        spinner.enable_steady_tick(Duration::from_millis(120));
        Self {
            spinner,
            start_time: Instant::now(),
        }
    }

    pub fn finish(&self) -> Duration {
        self.spinner.finish_and_clear();
        self.start_time.elapsed()
    }
}

/// Human-readable binary size, switching unit once a value passes 1100 of the
/// smaller one.
pub fn format_bytes(bytes: f64) -> String {
    const KIB: f64 = 1024.0;
    if bytes.is_nan() {
        return "unknown".to_string();
    }
    if bytes < 1100.0 {
        format!("{bytes:.2} B")
    } else if bytes < 1100.0 * KIB {
        format!("{:.2} KiB", bytes / KIB)
    } else if bytes < 1100.0 * KIB * KIB {
        format!("{:.2} MiB", bytes / (KIB * KIB))
    } else {
        format!("{:.2} GiB", bytes / (KIB * KIB * KIB))
    }
}

pub fn pluralize(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

/// `pluralize` for nouns without a regular plural.
pub fn pluralize_with(count: usize, singular: &str, plural: &str) -> String {
    let noun = if count == 1 { singular } else { plural };
    format!("{count} {noun}")
}
