//! One mirror run: scan, compare, delete, download

use crate::download::{download_files, DownloadContext, DownloadOutcome};
use crate::error::{Result, SyncError};
use crate::logger::Logger;
use crate::mapping::PathMapping;
use crate::orchestrator::CancelToken;
use crate::progress::{ProgressSink, TransferStats};
use crate::reconcile::{LocalFile, Reconciler, Reconciliation};
use crate::remote::{Connector, RetryPolicy};
use crate::scan::{scan_remote, ScanOutcome};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub max_connections: usize,
    pub dry_run: bool,
    pub policy: RetryPolicy,
}

/// Machine-readable summary of a run.
#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub scanned_files: usize,
    pub scanned_directories: usize,
    pub scan_seconds: f64,
    /// Remote directories that could not be listed.
    pub missed: Vec<String>,
    pub up_to_date: usize,
    pub planned_downloads: Vec<PathBuf>,
    pub planned_bytes: u64,
    /// Files deleted, or that would be deleted on a dry run.
    pub deleted: Vec<PathBuf>,
    pub download: Option<DownloadOutcome>,
    pub elapsed_seconds: f64,
    pub average_speed: f64,
    /// Connection faults that were absorbed along the way.
    pub tolerated_faults: Vec<String>,
}

impl SyncReport {
    /// Everything planned actually happened.
    pub fn is_clean(&self) -> bool {
        self.missed.is_empty() && self.download.as_ref().map_or(true, DownloadOutcome::is_complete)
    }
}

/// Phase notifications for interactive front ends. All methods default to no-ops.
pub trait PhaseObserver {
    fn scanned(&self, _files: usize, _missed: &[String], _elapsed: Duration) {}
    fn planned(&self, _plan: &Reconciliation) {}
    fn deleted(&self, _paths: &[PathBuf]) {}
}

impl PhaseObserver for () {}

pub struct Mirror<'a, C: Connector> {
    connector: &'a C,
    roots: Vec<PathMapping>,
    reconciler: Reconciler,
    options: SyncOptions,
    cancel: &'a CancelToken,
    logger: &'a dyn Logger,
}

impl<'a, C: Connector> Mirror<'a, C> {
    pub fn new(
        connector: &'a C,
        roots: Vec<PathMapping>,
        reconciler: Reconciler,
        options: SyncOptions,
        cancel: &'a CancelToken,
        logger: &'a dyn Logger,
    ) -> Self {
        Self {
            connector,
            roots,
            reconciler,
            options,
            cancel,
            logger,
        }
    }

    pub fn scan(&self) -> Result<ScanOutcome> {
        scan_remote(
            self.connector,
            &self.roots,
            self.options.max_connections,
            &self.options.policy,
            self.cancel,
            self.logger,
        )
    }

    /// Compare the scan against local files. Local files beneath a remote
    /// directory that could not be listed are never deleted.
    pub fn plan(&self, scan: &mut ScanOutcome) -> Result<Reconciliation> {
        self.cancel.check()?;
        let remote = std::mem::take(&mut scan.files);
        let mut plan = self.reconciler.reconcile(remote, &self.roots)?;
        plan.deletions
            .retain(|f| !scan.missed_local.iter().any(|dir| f.path.starts_with(dir)));
        Ok(plan)
    }

    pub fn delete(&self, files: &[LocalFile]) -> Result<Vec<PathBuf>> {
        self.cancel.check()?;
        delete_files(files, self.logger)
    }

    pub fn download(
        &self,
        plan: &Reconciliation,
        sink: &dyn ProgressSink,
        stats: &TransferStats,
    ) -> Result<DownloadOutcome> {
        self.cancel.check()?;
        let ctx = DownloadContext {
            policy: &self.options.policy,
            cancel: self.cancel,
            logger: self.logger,
            sink,
            stats,
        };
        download_files(self.connector, &plan.downloads, self.options.max_connections, &ctx)
    }

    /// Run every phase. Deletions must all succeed before anything is downloaded.
    ///
    /// A failed run returns `SyncError::Interrupted` naming the files left
    /// incomplete and the remote directories left unscanned, if there are any.
    pub fn run(&self, sink: &dyn ProgressSink, observer: &dyn PhaseObserver) -> Result<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport {
            dry_run: self.options.dry_run,
            ..SyncReport::default()
        };

        let mut scan = self.scan()?;
        report.scan_seconds = started.elapsed().as_secs_f64();
        report.scanned_files = scan.files.len();
        report.scanned_directories = scan.directories_listed;
        report.missed = std::mem::take(&mut scan.missed);
        report.tolerated_faults.extend(scan.faults.iter().map(|e| e.to_string()));
        observer.scanned(report.scanned_files, &report.missed, started.elapsed());

        let plan = self
            .plan(&mut scan)
            .map_err(|e| SyncError::interrupted(e, Vec::new(), report.missed.clone()))?;
        report.up_to_date = plan.up_to_date;
        report.planned_downloads = plan.downloads.iter().map(|d| d.local_path.clone()).collect();
        report.planned_bytes = plan.download_bytes();
        observer.planned(&plan);

        if self.options.dry_run {
            report.deleted = plan.deletions.iter().map(|f| f.path.clone()).collect();
            report.elapsed_seconds = started.elapsed().as_secs_f64();
            return Ok(report);
        }

        let unfinished = |e: SyncError, incomplete: Vec<PathBuf>| {
            SyncError::interrupted(e, incomplete, report.missed.clone())
        };
        let deleted = self
            .delete(&plan.deletions)
            .map_err(|e| unfinished(e, report.planned_downloads.clone()))?;
        report.deleted = deleted;
        observer.deleted(&report.deleted);

        let stats = TransferStats::new();
        let outcome = self.download(&plan, sink, &stats).map_err(|e| {
            SyncError::interrupted(e, Vec::new(), report.missed.clone())
        })?;
        let snap = stats.snapshot();
        report.average_speed = snap.speed();
        report.tolerated_faults.extend(outcome.faults.iter().map(|e| e.to_string()));
        self.logger.done(outcome.completed.len() as u64, outcome.bytes, snap.elapsed_secs);
        report.download = Some(outcome);
        report.elapsed_seconds = started.elapsed().as_secs_f64();
        Ok(report)
    }
}

/// Delete every file, then fail if any deletion failed. Already-missing files
/// count as deleted.
pub fn delete_files(files: &[LocalFile], logger: &dyn Logger) -> Result<Vec<PathBuf>> {
    let results: Vec<std::result::Result<PathBuf, SyncError>> = files
        .par_iter()
        .map(|f| match fs::remove_file(&f.path) {
            Ok(()) => {
                logger.delete(&f.path);
                Ok(f.path.clone())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(f.path.clone()),
            Err(e) => {
                logger.error("delete", &f.path.display().to_string(), &e.to_string());
                Err(SyncError::local_io(&f.path, e))
            }
        })
        .collect();

    let mut deleted = Vec::with_capacity(files.len());
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(path) => deleted.push(path),
            Err(e) => failures.push(e),
        }
    }
    if failures.is_empty() {
        Ok(deleted)
    } else {
        Err(SyncError::Aggregate(failures))
    }
}
