use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Event sink for the sync engine. Every method defaults to a no-op so
/// hot paths cost nothing with `NoopLogger`.
pub trait Logger: Send + Sync {
    fn listed(&self, _remote: &str, _files: usize, _dirs: usize) {}
    fn retry(&self, _context: &str, _subject: &str, _attempt: u32, _msg: &str) {}
    fn chunk_done(&self, _local: &Path, _offset: u64, _length: u32) {}
    fn file_done(&self, _local: &Path, _bytes: u64) {}
    fn file_failed(&self, _local: &Path, _bytes: u64, _total: u64) {}
    fn delete(&self, _path: &Path) {}
    fn error(&self, _context: &str, _subject: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn listed(&self, remote: &str, files: usize, dirs: usize) {
        self.line(&format!("LIST remote={remote} files={files} dirs={dirs}"));
    }
    fn retry(&self, context: &str, subject: &str, attempt: u32, msg: &str) {
        self.line(&format!(
            "RETRY ctx={context} subject={subject} attempt={attempt} msg={msg}"
        ));
    }
    fn chunk_done(&self, local: &Path, offset: u64, length: u32) {
        self.line(&format!(
            "CHUNK path={} offset={} length={}",
            local.display(),
            offset,
            length
        ));
    }
    fn file_done(&self, local: &Path, bytes: u64) {
        self.line(&format!("FILE path={} bytes={}", local.display(), bytes));
    }
    fn file_failed(&self, local: &Path, bytes: u64, total: u64) {
        self.line(&format!(
            "FAILED path={} bytes={}/{}",
            local.display(),
            bytes,
            total
        ));
    }
    fn delete(&self, path: &Path) {
        self.line(&format!("DELETE path={}", path.display()));
    }
    fn error(&self, context: &str, subject: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} subject={subject} msg={msg}"));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}
