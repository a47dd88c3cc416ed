//! sidesync library
//!
//! Mirrors directories of a remote file repository into a local tree: a
//! parallel scan over several connections, a size-based comparison, then
//! chunked downloads written in place by a pool of workers.

pub mod chunk;
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
#[cfg(feature = "ftp")]
pub mod ftp;
pub mod logger;
pub mod mapping;
pub mod orchestrator;
pub mod progress;
pub mod range_lock;
pub mod reconcile;
pub mod remote;
pub mod scan;
pub mod sync;

pub use error::{RemoteError, Result, SyncError};
