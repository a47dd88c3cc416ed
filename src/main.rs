//! sidesync - mirror remote mod directories into a local game install

use anyhow::{bail, Context, Result};
use clap::Parser;
use sidesync::cli::Args;
use sidesync::config::Config;
use sidesync::logger::{Logger, NoopLogger, TextLogger};
use sidesync::orchestrator::{CancelReason, CancelToken};
use sidesync::progress::{format_bytes, pluralize, pluralize_with, ByteProgress, ChunkTick, PhaseSpinner, ProgressSink};
use sidesync::reconcile::{Reconciler, Reconciliation};
use sidesync::remote::{Connector, FsRemote, RetryPolicy};
use sidesync::sync::{Mirror, PhaseObserver, SyncOptions, SyncReport};
use sidesync::SyncError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const EXIT_CANCELED: u8 = 130;

fn main() -> ExitCode {
    let args = Args::parse();
    let cancel = CancelToken::new();

    let handler_token = cancel.clone();
    let presses = AtomicU8::new(0);
    if let Err(e) = ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\nInterrupted by user. Finishing up (Ctrl-C again to exit now)...");
            handler_token.cancel(CancelReason::User);
        } else {
            std::process::exit(i32::from(EXIT_CANCELED));
        }
    }) {
        eprintln!("warning: could not install Ctrl-C handler: {e}");
    }

    match run(&args, &cancel) {
        Ok(report) if report.is_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) if e.downcast_ref::<SyncError>().is_some_and(SyncError::is_canceled) => {
            eprintln!("Canceled.");
            ExitCode::from(EXIT_CANCELED)
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, cancel: &CancelToken) -> Result<SyncReport> {
    let mut config = Config::load(&args.config)?;
    args.apply(&mut config)?;

    // Choose logger once; zero overhead in hot paths with NoopLogger
    let logger: Arc<dyn Logger> = match args.log_file {
        Some(ref p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("opening log file {}", p.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    if let Some(ref dir) = args.source_dir {
        return mirror_with(&FsRemote::new(dir), &config, args, cancel, logger.as_ref());
    }
    ftp_mirror(&config, args, cancel, logger.as_ref())
}

#[cfg(feature = "ftp")]
fn ftp_mirror(config: &Config, args: &Args, cancel: &CancelToken, logger: &dyn Logger) -> Result<SyncReport> {
    use sidesync::ftp::{FtpConnector, FtpSettings};

    if config.connection.address.is_empty() {
        bail!("connection.address is not set; configure a server or pass --source-dir");
    }
    let connector = FtpConnector::new(FtpSettings::from(&config.connection));
    mirror_with(&connector, config, args, cancel, logger)
}

#[cfg(not(feature = "ftp"))]
fn ftp_mirror(_config: &Config, _args: &Args, _cancel: &CancelToken, _logger: &dyn Logger) -> Result<SyncReport> {
    bail!("built without FTP support; pass --source-dir to mirror a local directory")
}

fn mirror_with<C: Connector>(
    connector: &C,
    config: &Config,
    args: &Args,
    cancel: &CancelToken,
    logger: &dyn Logger,
) -> Result<SyncReport> {
    let mut reconciler = Reconciler::new(config.chunk_size_bytes());
    if let Some(rule) = config.variant_rule() {
        reconciler = reconciler.with_variant_rule(rule);
    }
    let options = SyncOptions {
        max_connections: config.connection.max_connections,
        dry_run: args.dry_run,
        policy: RetryPolicy::default(),
    };
    let mirror = Mirror::new(connector, config.roots(), reconciler, options, cancel, logger);

    let interactive = !args.json;
    if interactive {
        println!(
            "Mirroring {} from {} with {}.",
            pluralize_with(config.mappings.len(), "directory", "directories"),
            connector.target(),
            pluralize(config.connection.max_connections, "connection")
        );
        if args.dry_run {
            println!("DRY RUN MODE - nothing will be deleted or downloaded");
        }
    }

    let console = Console::new(interactive, args.verbose);
    let result = mirror.run(&console, &console);
    console.finish();
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            print_failure(&e, args.json)?;
            return Err(e.into());
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report, args.verbose);
    }
    Ok(report)
}

/// Terminal front end: a spinner while scanning, then a byte bar.
struct Console {
    interactive: bool,
    verbose: bool,
    spinner: PhaseSpinner,
    bar: OnceLock<ByteProgress>,
}

impl Console {
    fn new(interactive: bool, verbose: bool) -> Self {
        Self {
            interactive,
            verbose,
            spinner: PhaseSpinner::new("Scanning the server...", interactive),
            bar: OnceLock::new(),
        }
    }

    fn say(&self, line: &str) {
        if !self.interactive {
            return;
        }
        match self.bar.get() {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    fn finish(&self) {
        self.spinner.finish();
        if let Some(bar) = self.bar.get() {
            bar.finish();
        }
    }
}

impl ProgressSink for Console {
    fn report(&self, tick: &ChunkTick<'_>) {
        if let Some(bar) = self.bar.get() {
            bar.report(tick);
        }
    }
}

impl PhaseObserver for Console {
    fn scanned(&self, files: usize, missed: &[String], elapsed: Duration) {
        self.spinner.finish();
        self.say(&format!(
            "Scanned {} in {}ms.",
            pluralize(files, "file"),
            elapsed.as_millis()
        ));
        if !missed.is_empty() {
            self.say("Some directories could not be scanned due to network errors; local files beneath them are left alone.");
            if self.verbose {
                for dir in missed {
                    self.say(&format!("  missed {dir}"));
                }
            }
        }
    }

    fn planned(&self, plan: &Reconciliation) {
        if plan.is_noop() {
            self.say(&format!("All {} local files are up to date.", plan.up_to_date));
            return;
        }
        self.say(&format!(
            "{} ({}) to download and {} to delete.",
            pluralize(plan.downloads.len(), "file"),
            format_bytes(plan.download_bytes() as f64),
            pluralize(plan.deletions.len(), "file")
        ));
        if self.verbose {
            for f in &plan.deletions {
                self.say(&format!("  delete {}", f.path.display()));
            }
            for d in &plan.downloads {
                self.say(&format!("  fetch  {} ({})", d.local_path.display(), format_bytes(d.total_size as f64)));
            }
        }
        if !plan.downloads.is_empty() {
            let _ = self.bar.set(ByteProgress::new(plan.download_bytes(), self.interactive));
        }
    }

    fn deleted(&self, paths: &[PathBuf]) {
        if !paths.is_empty() {
            self.say(&format!("{} deleted.", pluralize(paths.len(), "file")));
        }
    }
}

/// Name what a failed run left undone so the next run can be judged.
fn print_failure(err: &SyncError, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "error": err.to_string(),
            "canceled": err.is_canceled(),
            "incomplete": err.incomplete(),
            "missed": err.missed(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    for path in err.incomplete() {
        eprintln!("  incomplete: {}", path.display());
    }
    for dir in err.missed() {
        eprintln!("  not scanned: {dir}");
    }
    if !err.incomplete().is_empty() {
        eprintln!(
            "{} could not be downloaded; run again to retry.",
            pluralize(err.incomplete().len(), "file")
        );
    }
    Ok(())
}

fn print_summary(report: &SyncReport, verbose: bool) {
    if report.dry_run {
        println!(
            "Would delete {} and download {} ({}).",
            pluralize(report.deleted.len(), "file"),
            pluralize(report.planned_downloads.len(), "file"),
            format_bytes(report.planned_bytes as f64)
        );
        return;
    }
    let Some(ref outcome) = report.download else {
        return;
    };
    if !outcome.completed.is_empty() {
        println!(
            "Downloaded {} ({}) in {:.1}s at {}/s.",
            pluralize(outcome.completed.len(), "file"),
            format_bytes(outcome.bytes as f64),
            report.elapsed_seconds,
            format_bytes(report.average_speed)
        );
    }
    for path in outcome.failed.iter().chain(&outcome.not_started) {
        eprintln!("  incomplete: {}", path.display());
    }
    if !outcome.failed.is_empty() || !outcome.not_started.is_empty() {
        eprintln!(
            "{} could not be downloaded; run again to retry.",
            pluralize(outcome.failed.len() + outcome.not_started.len(), "file")
        );
    }
    if verbose {
        for fault in &report.tolerated_faults {
            eprintln!("  recovered: {fault}");
        }
    }
}
