//! Error taxonomy for the scan-and-sync engine
//!
//! `RemoteError` is what a protocol client reports; `SyncError` is what workers
//! hand to the orchestrator, which decides fatality from `is_connection_scoped`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a remote client implementation.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The server answered a command with a negative reply.
    #[error("command rejected ({code}): {message}")]
    Command { code: u32, message: String },

    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other protocol-level failure (malformed reply, unexpected state).
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Socket timeouts surface as `WouldBlock` on some platforms.
pub(crate) fn normalize_timeout(e: io::Error) -> io::Error {
    if e.kind() == io::ErrorKind::WouldBlock {
        io::Error::new(io::ErrorKind::TimedOut, e)
    } else {
        e
    }
}

impl RemoteError {
    /// Errors worth retrying on the same connection.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Io(_) | RemoteError::Connect(_) => true,
            RemoteError::Command { code, .. } => (400..500).contains(code),
            RemoteError::Protocol(_) => false,
        }
    }

    /// Listing failures that are retried in place before the entry is given up.
    pub fn is_retryable_listing(&self) -> bool {
        matches!(self, RemoteError::Io(_) | RemoteError::Command { .. })
    }
}

/// Errors surfaced by workers and phases.
#[derive(Debug, Error)]
pub enum SyncError {
    /// One connection could not be established. Siblings keep going.
    #[error("could not connect to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: RemoteError,
    },

    /// Retries on one connection ran out; the unit of work went back to the queue.
    #[error("gave up on {path} after {attempts} attempts: {source}")]
    Transient {
        path: String,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// Non-retryable remote failure (authentication, missing path).
    #[error("remote error on {path}: {source}")]
    Remote {
        path: String,
        #[source]
        source: RemoteError,
    },

    /// Protocol errors kept coming back on the same connection.
    #[error("repeated protocol errors while listing {path}: {}", join_messages(.errors))]
    Repeated { path: String, errors: Vec<RemoteError> },

    #[error("local I/O error on {}: {source}", .path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A logic defect. Never absorbed.
    #[error("internal fault: {0}")]
    Internal(String),

    #[error("operation canceled")]
    Canceled,

    #[error("{}", FaultList(.0))]
    Aggregate(Vec<SyncError>),

    /// A phase stopped early. Carries what was left undone.
    #[error(
        "stopped with {} file(s) incomplete and {} remote director(ies) unscanned",
        .incomplete.len(),
        .missed.len()
    )]
    Interrupted {
        /// Planned downloads that are not complete on disk.
        incomplete: Vec<PathBuf>,
        /// Remote directories that were never listed.
        missed: Vec<String>,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    pub fn local_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Attach the work `source` left undone. Merges into an existing
    /// `Interrupted` and returns `source` unchanged when there is nothing to add.
    pub fn interrupted(source: SyncError, incomplete: Vec<PathBuf>, missed: Vec<String>) -> Self {
        match source {
            SyncError::Interrupted {
                incomplete: mut have_incomplete,
                missed: mut have_missed,
                source,
            } => {
                have_incomplete.extend(incomplete);
                have_missed.extend(missed);
                SyncError::Interrupted {
                    incomplete: have_incomplete,
                    missed: have_missed,
                    source,
                }
            }
            source if incomplete.is_empty() && missed.is_empty() => source,
            source => SyncError::Interrupted {
                incomplete,
                missed,
                source: Box::new(source),
            },
        }
    }

    /// The error underneath any `Interrupted` wrapping.
    pub fn cause(&self) -> &SyncError {
        match self {
            SyncError::Interrupted { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Files left incomplete by the failed phase.
    pub fn incomplete(&self) -> &[PathBuf] {
        match self {
            SyncError::Interrupted { incomplete, .. } => incomplete,
            _ => &[],
        }
    }

    /// Remote directories left unscanned by the failed phase.
    pub fn missed(&self) -> &[String] {
        match self {
            SyncError::Interrupted { missed, .. } => missed,
            _ => &[],
        }
    }

    /// Faults confined to a single connection; the orchestrator tolerates these
    /// as long as another worker still makes progress.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, SyncError::Connection { .. } | SyncError::Transient { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.cause(), SyncError::Canceled)
    }

    /// Flatten nested aggregates and interruptions into a single list.
    pub fn into_errors(self) -> Vec<SyncError> {
        match self {
            SyncError::Aggregate(errors) => errors
                .into_iter()
                .flat_map(SyncError::into_errors)
                .collect(),
            SyncError::Interrupted { source, .. } => source.into_errors(),
            other => vec![other],
        }
    }
}

fn join_messages(errors: &[RemoteError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

struct FaultList<'a>(&'a [SyncError]);

impl fmt::Display for FaultList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            write!(f, "{} {}", if i == 0 { ":" } else { ";" }, e)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
