//! Chunked parallel download
//!
//! Every file is split into chunks that go on one shared queue. Workers pull
//! chunks in any order and write them in place, so several workers can be
//! filling different ranges of the same file at once. The progress table is
//! the single source of truth for how much of each file has landed.

use crate::chunk::{DownloadChunk, FileDownload};
use crate::error::{normalize_timeout, RemoteError, Result, SyncError};
use crate::logger::Logger;
use crate::orchestrator::{run_pool, CancelToken};
use crate::progress::{ChunkTick, ProgressSink, TransferStats};
use crate::range_lock::RangeLock;
use crate::remote::{connect_with_retry, Connector, RangeError, RemoteClient, RetryPolicy};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Copy buffer per worker
pub const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DownloadState {
    Queued,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDownloadProgress {
    pub total: u64,
    pub downloaded: u64,
    /// The local file has been created and sized.
    pub initialized: bool,
    pub state: DownloadState,
}

/// Per-file progress, one lock per file. The set of files is fixed when the
/// run starts.
pub struct ProgressTable {
    entries: HashMap<PathBuf, Mutex<FileDownloadProgress>>,
}

impl ProgressTable {
    pub fn new(files: &[FileDownload]) -> Self {
        let entries = files
            .iter()
            .map(|f| {
                let progress = FileDownloadProgress {
                    total: f.total_size,
                    downloaded: 0,
                    initialized: false,
                    state: DownloadState::Queued,
                };
                (f.local_path.clone(), Mutex::new(progress))
            })
            .collect();
        Self { entries }
    }

    fn entry(&self, path: &Path) -> Result<&Mutex<FileDownloadProgress>> {
        self.entries
            .get(path)
            .ok_or_else(|| SyncError::Internal(format!("{} is not part of this run", path.display())))
    }

    pub fn get(&self, path: &Path) -> Option<FileDownloadProgress> {
        self.entries.get(path).map(|e| e.lock().clone())
    }

    /// Create and size the local file on the first claim of any of its chunks.
    /// Returns the handle opened for it, or `None` if a sibling already did.
    fn initialize(&self, path: &Path) -> Result<Option<File>> {
        let mut progress = self.entry(path)?.lock();
        if progress.initialized {
            return Ok(None);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::local_io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SyncError::local_io(path, e))?;
        file.set_len(progress.total)
            .map_err(|e| SyncError::local_io(path, e))?;
        progress.initialized = true;
        progress.state = DownloadState::InProgress;
        Ok(Some(file))
    }

    /// Create an empty file and mark it complete.
    fn touch(&self, path: &Path) -> Result<()> {
        let mut progress = self.entry(path)?.lock();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::local_io(parent, e))?;
        }
        File::create(path).map_err(|e| SyncError::local_io(path, e))?;
        progress.initialized = true;
        progress.state = DownloadState::Complete;
        Ok(())
    }

    /// Account `bytes` more written bytes. Returns true for the write that
    /// completes the file.
    fn record(&self, path: &Path, bytes: u64) -> Result<bool> {
        let mut progress = self.entry(path)?.lock();
        let downloaded = progress.downloaded + bytes;
        if downloaded > progress.total {
            return Err(SyncError::Internal(format!(
                "{}: {} bytes written exceeds size {}",
                path.display(),
                downloaded,
                progress.total
            )));
        }
        progress.downloaded = downloaded;
        if downloaded == progress.total && progress.state != DownloadState::Complete {
            progress.state = DownloadState::Complete;
            return Ok(true);
        }
        Ok(false)
    }

    fn rollback(&self, path: &Path, bytes: u64) -> Result<()> {
        let mut progress = self.entry(path)?.lock();
        progress.downloaded = progress.downloaded.saturating_sub(bytes);
        Ok(())
    }

    /// Fail and delete every file that was started but not finished.
    fn finalize(&self, logger: &dyn Logger) -> Settled {
        let mut settled = Settled::default();
        for (path, entry) in &self.entries {
            let mut progress = entry.lock();
            if !progress.initialized {
                settled.not_started.push(path.clone());
                continue;
            }
            if progress.state == DownloadState::Complete {
                settled.completed.push(path.clone());
                settled.bytes += progress.total;
                continue;
            }
            progress.state = DownloadState::Failed;
            logger.file_failed(path, progress.downloaded, progress.total);
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    logger.error("cleanup", &path.display().to_string(), &e.to_string());
                }
            }
            settled.failed.push(path.clone());
        }
        settled.completed.sort();
        settled.failed.sort();
        settled.not_started.sort();
        settled
    }
}

#[derive(Default)]
struct Settled {
    completed: Vec<PathBuf>,
    failed: Vec<PathBuf>,
    not_started: Vec<PathBuf>,
    /// Size of the completed files.
    bytes: u64,
}

/// What a download run left behind.
#[derive(Debug, Default, Serialize)]
pub struct DownloadOutcome {
    pub completed: Vec<PathBuf>,
    /// Started but incomplete; already deleted from disk.
    pub failed: Vec<PathBuf>,
    pub not_started: Vec<PathBuf>,
    /// Bytes of the files that completed in this run.
    pub bytes: u64,
    pub workers: usize,
    #[serde(skip)]
    pub faults: Vec<SyncError>,
}

impl DownloadOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.not_started.is_empty()
    }
}

/// Shared services handed to every download worker.
pub struct DownloadContext<'a> {
    pub policy: &'a RetryPolicy,
    pub cancel: &'a CancelToken,
    pub logger: &'a dyn Logger,
    pub sink: &'a dyn ProgressSink,
    pub stats: &'a TransferStats,
}

/// Bookkeeping for one attempt at one chunk
#[derive(Debug, Default)]
struct ChunkCopy {
    copied: u64,
    finished_file: bool,
}

struct DownloadRun<'a, C: Connector> {
    connector: &'a C,
    ctx: &'a DownloadContext<'a>,
    queue: Mutex<VecDeque<DownloadChunk>>,
    table: ProgressTable,
}

/// Download `files` with up to `max_connections` workers.
///
/// Cleanup of torn files always runs, also when the run fails.
pub fn download_files<C: Connector>(
    connector: &C,
    files: &[FileDownload],
    max_connections: usize,
    ctx: &DownloadContext<'_>,
) -> Result<DownloadOutcome> {
    let table = ProgressTable::new(files);

    for file in files.iter().filter(|f| f.is_empty()) {
        table.touch(&file.local_path)?;
        ctx.logger.file_done(&file.local_path, 0);
        ctx.stats.file_done();
    }

    let queue: VecDeque<DownloadChunk> = files.iter().flat_map(|f| f.chunks.iter().cloned()).collect();
    let workers = max_connections.max(1).min(queue.len());
    let state = DownloadRun {
        connector,
        ctx,
        queue: Mutex::new(queue),
        table,
    };

    let pool = run_pool("download", workers, ctx.cancel, ctx.logger, |index| {
        state.run_worker(index)
    });
    let settled = state.table.finalize(ctx.logger);
    let report = match pool {
        Ok(report) => report,
        Err(e) => {
            let mut incomplete = settled.failed;
            incomplete.extend(settled.not_started);
            incomplete.sort();
            return Err(SyncError::interrupted(e, incomplete, Vec::new()));
        }
    };

    Ok(DownloadOutcome {
        completed: settled.completed,
        failed: settled.failed,
        not_started: settled.not_started,
        bytes: settled.bytes,
        workers,
        faults: report.faults,
    })
}

impl<C: Connector> DownloadRun<'_, C> {
    fn run_worker(&self, _index: usize) -> Result<()> {
        let mut client = connect_with_retry(self.connector, self.ctx.policy, self.ctx.cancel)?;
        let mut handle: Option<(PathBuf, File)> = None;
        let mut buf = vec![0u8; COPY_BUFFER];

        loop {
            self.ctx.cancel.check()?;
            let Some(chunk) = self.queue.lock().pop_front() else {
                return Ok(());
            };
            self.transfer(&mut client, &chunk, &mut handle, &mut buf)?;
        }
    }

    fn requeue(&self, chunk: &DownloadChunk) {
        self.queue.lock().push_back(chunk.clone());
    }

    /// Handle for the chunk's file, reusing the previous one when it matches.
    fn local_handle<'h>(
        &self,
        chunk: &DownloadChunk,
        handle: &'h mut Option<(PathBuf, File)>,
    ) -> Result<&'h File> {
        if let Some(file) = self.table.initialize(&chunk.local_path)? {
            *handle = Some((chunk.local_path.clone(), file));
        } else if !matches!(handle, Some((path, _)) if *path == chunk.local_path) {
            let file = OpenOptions::new()
                .write(true)
                .open(&chunk.local_path)
                .map_err(|e| SyncError::local_io(&chunk.local_path, e))?;
            *handle = Some((chunk.local_path.clone(), file));
        }
        match handle {
            Some((_, file)) => Ok(file),
            None => Err(SyncError::Internal("no local handle after claim".into())),
        }
    }

    /// Fetch one chunk, retrying failed opens on this connection.
    fn transfer(
        &self,
        client: &mut C::Client,
        chunk: &DownloadChunk,
        handle: &mut Option<(PathBuf, File)>,
        buf: &mut [u8],
    ) -> Result<()> {
        let file = match self.local_handle(chunk, handle) {
            Ok(file) => file,
            Err(e) => {
                self.requeue(chunk);
                return Err(e);
            }
        };
        let mut open_failures = 0;

        loop {
            let started = Instant::now();
            let mut attempt = ChunkCopy::default();
            let result = client.read_range(
                &chunk.remote_path,
                chunk.offset,
                u64::from(chunk.length),
                &mut |stream: &mut dyn Read| self.copy_chunk(stream, file, chunk, buf, &mut attempt, started),
            );

            match result {
                Ok(()) => {
                    self.ctx.logger.chunk_done(&chunk.local_path, chunk.offset, chunk.length);
                    self.ctx.stats.chunk_done();
                    if attempt.finished_file {
                        let total = self.table.get(&chunk.local_path).map_or(0, |p| p.total);
                        self.ctx.logger.file_done(&chunk.local_path, total);
                        self.ctx.stats.file_done();
                    }
                    return Ok(());
                }
                Err(RangeError::Open(e)) => {
                    open_failures += 1;
                    if open_failures > self.ctx.policy.open_retries {
                        self.requeue(chunk);
                        return Err(SyncError::Transient {
                            path: chunk.remote_path.clone(),
                            attempts: open_failures,
                            source: e,
                        });
                    }
                    self.ctx
                        .logger
                        .retry("download", &chunk.remote_path, open_failures, &e.to_string());
                    if self.ctx.cancel.is_canceled() {
                        self.requeue(chunk);
                        return Err(SyncError::Canceled);
                    }
                }
                Err(RangeError::Consume(e)) => {
                    self.abandon(chunk, attempt.copied, started)?;
                    if matches!(e, SyncError::Transient { .. } | SyncError::Canceled) {
                        self.requeue(chunk);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Copy the stream into `[offset, offset + length)` of the local file
    /// under an exclusive range lock.
    fn copy_chunk(
        &self,
        stream: &mut dyn Read,
        file: &File,
        chunk: &DownloadChunk,
        buf: &mut [u8],
        attempt: &mut ChunkCopy,
        started: Instant,
    ) -> Result<()> {
        let local_err = |e: io::Error| SyncError::local_io(&chunk.local_path, e);
        let _lock = RangeLock::acquire(file, chunk.offset, u64::from(chunk.length)).map_err(local_err)?;
        let mut out = file;
        out.seek(SeekFrom::Start(chunk.offset)).map_err(local_err)?;

        let length = u64::from(chunk.length);
        while attempt.copied < length {
            self.ctx.cancel.check()?;
            let want = (length - attempt.copied).min(buf.len() as u64) as usize;
            let n = match stream.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(remote_read_error(
                        chunk,
                        io::Error::new(io::ErrorKind::UnexpectedEof, "remote stream ended early"),
                    ))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(remote_read_error(chunk, e)),
            };
            out.write_all(&buf[..n]).map_err(local_err)?;
            attempt.finished_file |= self.table.record(&chunk.local_path, n as u64)?;
            attempt.copied += n as u64;
            self.ctx.stats.add_bytes(n as u64);
            self.ctx.sink.report(&ChunkTick {
                local_path: &chunk.local_path,
                bytes: n as u64,
                elapsed: started.elapsed(),
                chunk_length: chunk.length,
            });
        }
        Ok(())
    }

    /// Take back the bytes of an interrupted chunk.
    fn abandon(&self, chunk: &DownloadChunk, copied: u64, started: Instant) -> Result<()> {
        self.table.rollback(&chunk.local_path, copied)?;
        self.ctx.stats.sub_bytes(copied);
        self.ctx.sink.report(&ChunkTick {
            local_path: &chunk.local_path,
            bytes: 0,
            elapsed: started.elapsed(),
            chunk_length: chunk.length,
        });
        Ok(())
    }
}

fn remote_read_error(chunk: &DownloadChunk, e: io::Error) -> SyncError {
    SyncError::Transient {
        path: chunk.remote_path.clone(),
        attempts: 1,
        source: RemoteError::Io(normalize_timeout(e)),
    }
}
