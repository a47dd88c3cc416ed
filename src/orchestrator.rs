//! Worker pool supervision
//!
//! Runs N failable workers on scoped threads, watches them finish in
//! completion order and decides once, centrally, whether a fault is fatal.

use crate::error::{Result, SyncError};
use crate::logger::Logger;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const NOT_CANCELED: u8 = 0;
const CANCELED_BY_USER: u8 = 1;
const CANCELED_BY_FAULT: u8 = 2;

/// Why a run was canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    User,
    Fault,
}

/// Shared cooperative cancellation flag. The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        let code = match reason {
            CancelReason::User => CANCELED_BY_USER,
            CancelReason::Fault => CANCELED_BY_FAULT,
        };
        let _ = self
            .0
            .compare_exchange(NOT_CANCELED, code, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst) != NOT_CANCELED
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.0.load(Ordering::SeqCst) {
            CANCELED_BY_USER => Some(CancelReason::User),
            CANCELED_BY_FAULT => Some(CancelReason::Fault),
            _ => None,
        }
    }

    /// `Err(Canceled)` once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(SyncError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_canceled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

/// Final state of one worker
#[derive(Debug)]
pub enum TaskState<T> {
    Completed(T),
    Canceled,
    Faulted(SyncError),
}

/// Outcome of a pool run that was not fatal
#[derive(Debug)]
pub struct PoolReport<T> {
    pub completed: Vec<T>,
    /// Tolerated, connection-scoped faults.
    pub faults: Vec<SyncError>,
    pub canceled: usize,
}

/// Run `workers` copies of `task`, each given its worker index.
///
/// Returns `Err(Canceled)` if the user canceled, `Err(Aggregate)` if every
/// worker failed or any worker failed with a fault that is not
/// connection-scoped. A fatal fault cancels the remaining workers through
/// `cancel` as soon as it is observed.
pub fn run_pool<T, F>(
    label: &str,
    workers: usize,
    cancel: &CancelToken,
    logger: &dyn Logger,
    task: F,
) -> Result<PoolReport<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Sync,
{
    let mut report = PoolReport {
        completed: Vec::with_capacity(workers),
        faults: Vec::new(),
        canceled: 0,
    };
    let mut fatal = false;

    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<(usize, TaskState<T>)>();
        for index in 0..workers {
            let tx = tx.clone();
            let task = &task;
            scope.spawn(move || {
                let state = match panic::catch_unwind(AssertUnwindSafe(|| task(index))) {
                    Ok(Ok(value)) => TaskState::Completed(value),
                    Ok(Err(SyncError::Canceled)) => TaskState::Canceled,
                    Ok(Err(e)) => TaskState::Faulted(e),
                    Err(payload) => TaskState::Faulted(SyncError::Internal(format!(
                        "{label} worker {index} panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                };
                let _ = tx.send((index, state));
            });
        }
        drop(tx); // Close sender so receiver knows when all workers are done

        while let Ok((index, state)) = rx.recv() {
            match state {
                TaskState::Completed(value) => report.completed.push(value),
                TaskState::Canceled => report.canceled += 1,
                TaskState::Faulted(e) => {
                    logger.error(label, &format!("worker {index}"), &e.to_string());
                    if !e.is_connection_scoped() {
                        fatal = true;
                        cancel.cancel(CancelReason::Fault);
                    }
                    report.faults.push(e);
                }
            }
        }
    });

    if cancel.reason() == Some(CancelReason::User) {
        return Err(SyncError::Canceled);
    }
    if fatal || (workers > 0 && report.completed.is_empty()) {
        if report.faults.is_empty() {
            return Err(SyncError::Canceled);
        }
        return Err(SyncError::Aggregate(report.faults));
    }
    Ok(report)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
