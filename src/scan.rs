//! Concurrent remote tree scan
//!
//! Workers share one queue of directories to expand. A worker that finds the
//! queue empty marks itself idle on the `WaitBoard`; the scan is over only when
//! every worker is idle and the queue is still empty, since a busy sibling may
//! be about to enqueue subdirectories.

use crate::error::{RemoteError, Result, SyncError};
use crate::logger::Logger;
use crate::mapping::PathMapping;
use crate::orchestrator::{run_pool, CancelToken};
use crate::remote::{
    connect_with_retry, Connector, EntryKind, RemoteClient, RemoteEntry, RetryPolicy,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long an idle worker sleeps before polling the queue again
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Result of a scan
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Remote files keyed by their case-folded local path.
    pub files: HashMap<String, PathMapping>,
    /// Remote directories that could not be listed.
    pub missed: Vec<String>,
    /// Local counterparts of `missed`; nothing beneath them is known to be stale.
    pub missed_local: Vec<PathBuf>,
    /// Tolerated per-connection faults.
    pub faults: Vec<SyncError>,
    pub directories_listed: usize,
}

/// Per-worker idle flags, indexed by the worker number handed out at spawn.
struct WaitBoard {
    idle: Vec<AtomicBool>,
}

impl WaitBoard {
    fn new(workers: usize) -> Self {
        Self {
            idle: (0..workers).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn set_idle(&self, worker: usize, idle: bool) {
        self.idle[worker].store(idle, Ordering::SeqCst);
    }

    fn all_idle(&self) -> bool {
        self.idle.iter().all(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Marks a worker idle for good when it leaves, whatever the reason.
struct IdleOnExit<'a> {
    board: &'a WaitBoard,
    worker: usize,
}

impl Drop for IdleOnExit<'_> {
    fn drop(&mut self) {
        self.board.set_idle(self.worker, true);
    }
}

struct ScanState<'a, C: Connector> {
    connector: &'a C,
    policy: &'a RetryPolicy,
    cancel: &'a CancelToken,
    logger: &'a dyn Logger,
    queue: Mutex<Vec<PathMapping>>,
    files: Mutex<HashMap<String, PathMapping>>,
    empty_requeues: Mutex<HashMap<String, u32>>,
    board: WaitBoard,
}

/// Walk every root with `workers` connections and collect the files beneath.
pub fn scan_remote<C: Connector>(
    connector: &C,
    roots: &[PathMapping],
    workers: usize,
    policy: &RetryPolicy,
    cancel: &CancelToken,
    logger: &dyn Logger,
) -> Result<ScanOutcome> {
    if roots.is_empty() {
        return Ok(ScanOutcome::default());
    }
    let workers = workers.max(1);
    let state = ScanState {
        connector,
        policy,
        cancel,
        logger,
        queue: Mutex::new(roots.to_vec()),
        files: Mutex::new(HashMap::new()),
        empty_requeues: Mutex::new(HashMap::new()),
        board: WaitBoard::new(workers),
    };

    let pool = run_pool("scan", workers, cancel, logger, |index| state.run_worker(index));

    let files = state.files.into_inner();
    let leftover = state.queue.into_inner();
    let mut missed: Vec<String> = leftover.iter().map(PathMapping::remote_full_path).collect();
    missed.sort();
    missed.dedup();
    let mut missed_local: Vec<PathBuf> = leftover.iter().map(PathMapping::local_full_path).collect();
    missed_local.sort();
    missed_local.dedup();

    let report = match pool {
        Ok(report) => report,
        Err(e) => return Err(SyncError::interrupted(e, Vec::new(), missed)),
    };
    if files.is_empty() && !missed.is_empty() {
        let cause = if report.faults.is_empty() {
            SyncError::Internal("scan stopped with directories still queued".into())
        } else {
            SyncError::Aggregate(report.faults)
        };
        return Err(SyncError::interrupted(cause, Vec::new(), missed));
    }

    Ok(ScanOutcome {
        files,
        missed,
        missed_local,
        faults: report.faults,
        directories_listed: report.completed.iter().sum(),
    })
}

impl<C: Connector> ScanState<'_, C> {
    /// Returns the number of directories this worker listed.
    fn run_worker(&self, index: usize) -> Result<usize> {
        let _idle = IdleOnExit {
            board: &self.board,
            worker: index,
        };
        let mut client = connect_with_retry(self.connector, self.policy, self.cancel)?;
        let mut protocol_errors: Vec<RemoteError> = Vec::new();
        let mut retrying: Option<PathMapping> = None;
        let mut listed = 0;

        loop {
            if self.cancel.is_canceled() {
                if let Some(entry) = retrying.take() {
                    self.requeue(entry);
                }
                return Err(SyncError::Canceled);
            }

            let entry = match retrying.take() {
                Some(entry) => entry,
                None => match self.take(index) {
                    Some(entry) => entry,
                    None => {
                        if self.board.all_idle() && self.queue.lock().is_empty() {
                            return Ok(listed);
                        }
                        self.cancel.sleep(IDLE_POLL);
                        continue;
                    }
                },
            };

            let remote = entry.remote_full_path();
            match self.list_with_retry(&mut client, &remote) {
                Ok(listing) => {
                    protocol_errors.clear();
                    listed += 1;
                    self.absorb(entry, &remote, listing);
                }
                Err(SyncError::Canceled) => {
                    self.requeue(entry);
                    return Err(SyncError::Canceled);
                }
                Err(SyncError::Remote { source, .. }) if !source.is_retryable_listing() => {
                    self.logger
                        .retry("scan", &remote, protocol_errors.len() as u32 + 1, &source.to_string());
                    protocol_errors.push(source);
                    if protocol_errors.len() > self.policy.protocol_error_limit {
                        self.requeue(entry);
                        return Err(SyncError::Repeated {
                            path: remote,
                            errors: protocol_errors,
                        });
                    }
                    retrying = Some(entry);
                }
                Err(e) => {
                    self.requeue(entry);
                    return Err(e);
                }
            }
        }
    }

    /// Pop the next directory, flipping this worker's idle flag around the attempt.
    fn take(&self, index: usize) -> Option<PathMapping> {
        self.board.set_idle(index, false);
        let entry = self.queue.lock().pop();
        if entry.is_none() {
            self.board.set_idle(index, true);
        }
        entry
    }

    fn requeue(&self, entry: PathMapping) {
        self.queue.lock().push(entry);
    }

    /// List one directory, retrying transient failures in place.
    fn list_with_retry(
        &self,
        client: &mut C::Client,
        remote: &str,
    ) -> Result<Vec<RemoteEntry>> {
        let mut attempts = 0;
        loop {
            match client.list(remote) {
                Ok(listing) => return Ok(listing),
                Err(e) if e.is_retryable_listing() && e.is_transient() => {
                    attempts += 1;
                    if attempts >= self.policy.list_attempts {
                        return Err(SyncError::Transient {
                            path: remote.to_string(),
                            attempts,
                            source: e,
                        });
                    }
                    self.logger.retry("scan", remote, attempts, &e.to_string());
                    self.cancel.sleep(self.policy.list_backoff * attempts);
                    self.cancel.check()?;
                }
                Err(e) => {
                    return Err(SyncError::Remote {
                        path: remote.to_string(),
                        source: e,
                    })
                }
            }
        }
    }

    /// Fold one listing into the shared queue and result map.
    fn absorb(&self, entry: PathMapping, remote: &str, listing: Vec<RemoteEntry>) {
        if listing.is_empty() && self.suspect_empty(remote) {
            self.requeue(entry);
            return;
        }

        let mut found = Vec::new();
        let mut subdirs = Vec::new();
        for item in listing {
            if item.name == "." || item.name == ".." {
                continue;
            }
            match item.kind {
                EntryKind::File => found.push(entry.child(&item.name, Some(item.size))),
                EntryKind::Directory => subdirs.push(entry.child(&item.name, None)),
                EntryKind::Link => {}
            }
        }
        self.logger.listed(remote, found.len(), subdirs.len());

        if !found.is_empty() {
            let mut files = self.files.lock();
            for mapping in found {
                files.entry(mapping.lookup_key()).or_insert(mapping);
            }
        }
        if !subdirs.is_empty() {
            self.queue.lock().extend(subdirs);
        }
    }

    /// Empty listings are occasionally spurious; believe one only after it
    /// has come back empty `empty_listing_requeues + 1` times.
    fn suspect_empty(&self, remote: &str) -> bool {
        let mut seen = self.empty_requeues.lock();
        let count = seen.entry(remote.to_string()).or_insert(0);
        if *count < self.policy.empty_listing_requeues {
            *count += 1;
            true
        } else {
            false
        }
    }
}
