//! File decomposition into fixed-size byte ranges

use crate::error::{Result, SyncError};
use crate::mapping::PathMapping;
use std::path::PathBuf;

/// Default chunk size (10 MiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

/// One contiguous byte range of one file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadChunk {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub offset: u64,
    pub length: u32,
}

/// A file's full download plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDownload {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub chunks: Vec<DownloadChunk>,
}

impl FileDownload {
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        total_size: u64,
        chunk_size: u32,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(SyncError::Config("chunk size must be greater than zero".into()));
        }
        let local_path = local_path.into();
        let remote_path = remote_path.into();
        let chunks = chunk_ranges(total_size, chunk_size)
            .map(|(offset, length)| DownloadChunk {
                local_path: local_path.clone(),
                remote_path: remote_path.clone(),
                offset,
                length,
            })
            .collect();
        Ok(Self {
            local_path,
            remote_path,
            total_size,
            chunk_size,
            chunks,
        })
    }

    /// Plan a download for a scanned file mapping.
    pub fn from_mapping(mapping: &PathMapping, chunk_size: u32) -> Result<Self> {
        let size = mapping.file_size.ok_or_else(|| {
            SyncError::Internal(format!(
                "{} has no known size and cannot be downloaded",
                mapping.remote_full_path()
            ))
        })?;
        Self::new(
            mapping.local_full_path(),
            mapping.remote_full_path(),
            size,
            chunk_size,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }
}

/// `(offset, length)` pairs tiling `[0, size)`; empty for a zero-length file.
pub fn chunk_ranges(size: u64, chunk_size: u32) -> impl Iterator<Item = (u64, u32)> {
    let step = u64::from(chunk_size.max(1));
    (0..size.div_ceil(step)).map(move |i| {
        let offset = i * step;
        let length = (size - offset).min(step) as u32;
        (offset, length)
    })
}
