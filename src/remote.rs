//! Boundary to the remote repository
//!
//! The engine only needs two operations from a protocol client: list one
//! directory and stream one byte range. Each worker owns its own client,
//! created through a `Connector`.

use crate::error::{RemoteError, Result, SyncError};
use crate::orchestrator::CancelToken;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Link,
}

/// One item of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
        }
    }
}

/// Failure of a ranged read, split by where it happened.
#[derive(Debug)]
pub enum RangeError {
    /// The stream could not be opened; nothing was handed to the consumer.
    Open(RemoteError),
    /// The consumer returned an error while reading the stream.
    Consume(SyncError),
}

/// Consumer of a ranged read stream. Gets at most the requested byte count.
pub type RangeConsumer<'a> = &'a mut dyn FnMut(&mut dyn Read) -> Result<()>;

/// One live connection to the remote repository. Not shared between threads.
pub trait RemoteClient {
    fn list(&mut self, path: &str) -> std::result::Result<Vec<RemoteEntry>, RemoteError>;

    /// Open `[offset, offset + length)` of `path` and pass the stream to `consume`.
    fn read_range(
        &mut self,
        path: &str,
        offset: u64,
        length: u64,
        consume: RangeConsumer<'_>,
    ) -> std::result::Result<(), RangeError>;
}

/// Factory for per-worker connections.
pub trait Connector: Send + Sync {
    type Client: RemoteClient;

    fn connect(&self) -> std::result::Result<Self::Client, RemoteError>;

    /// Human-readable description of the remote end (for errors and logs).
    fn target(&self) -> String;
}

/// Retry budgets used by the scan and download workers
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    pub list_attempts: u32,
    pub list_backoff: Duration,
    /// Protocol errors tolerated on one connection before the worker aborts.
    pub protocol_error_limit: usize,
    /// How many times an empty listing is re-queued before it is believed.
    pub empty_listing_requeues: u32,
    pub open_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            connect_backoff: Duration::from_secs(1),
            list_attempts: 3,
            list_backoff: Duration::from_millis(500),
            protocol_error_limit: 2,
            empty_listing_requeues: 2,
            open_retries: 2,
        }
    }
}

impl RetryPolicy {
    /// Same budgets without any sleeping.
    pub fn immediate() -> Self {
        Self {
            connect_backoff: Duration::ZERO,
            list_backoff: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Establish a connection, retrying transient refusals.
pub fn connect_with_retry<C: Connector>(
    connector: &C,
    policy: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<C::Client> {
    let mut retries = 0;
    loop {
        cancel.check()?;
        match connector.connect() {
            Ok(client) => return Ok(client),
            Err(e) if e.is_transient() && retries < policy.connect_retries => {
                retries += 1;
                cancel.sleep(policy.connect_backoff);
            }
            Err(e) if e.is_transient() => {
                return Err(SyncError::Connection {
                    target: connector.target(),
                    source: e,
                })
            }
            Err(e) => {
                return Err(SyncError::Remote {
                    path: connector.target(),
                    source: e,
                })
            }
        }
    }
}

/// A directory tree on a local or mounted filesystem served as the remote side.
#[derive(Debug, Clone)]
pub struct FsRemote {
    base: PathBuf,
}

impl FsRemote {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl Connector for FsRemote {
    type Client = FsClient;

    fn connect(&self) -> std::result::Result<FsClient, RemoteError> {
        if !self.base.is_dir() {
            return Err(RemoteError::Command {
                code: 550,
                message: format!("{} is not a directory", self.base.display()),
            });
        }
        Ok(FsClient {
            base: self.base.clone(),
        })
    }

    fn target(&self) -> String {
        self.base.display().to_string()
    }
}

pub struct FsClient {
    base: PathBuf,
}

impl FsClient {
    fn resolve(&self, path: &str) -> PathBuf {
        self.base.join(path.trim_start_matches('/'))
    }
}

impl RemoteClient for FsClient {
    fn list(&mut self, path: &str) -> std::result::Result<Vec<RemoteEntry>, RemoteError> {
        let dir = self.resolve(path);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| fs_error(&dir, e))? {
            let entry = entry?;
            let meta = fs::symlink_metadata(entry.path())?;
            let kind = if meta.file_type().is_symlink() {
                EntryKind::Link
            } else if meta.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size: if kind == EntryKind::File { meta.len() } else { 0 },
            });
        }
        Ok(entries)
    }

    fn read_range(
        &mut self,
        path: &str,
        offset: u64,
        length: u64,
        consume: RangeConsumer<'_>,
    ) -> std::result::Result<(), RangeError> {
        let file_path = self.resolve(path);
        let mut file = File::open(&file_path).map_err(|e| RangeError::Open(fs_error(&file_path, e)))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| RangeError::Open(RemoteError::Io(e)))?;
        let mut reader = file.take(length);
        consume(&mut reader).map_err(RangeError::Consume)
    }
}

fn fs_error(path: &Path, err: io::Error) -> RemoteError {
    if err.kind() == io::ErrorKind::NotFound {
        RemoteError::Command {
            code: 550,
            message: format!("{}: no such file or directory", path.display()),
        }
    } else {
        RemoteError::Io(err)
    }
}
