//! Exclusive byte-range locks on open files
//!
//! Chunk writers lock exactly the bytes they are about to write so that two
//! handles on the same file never interleave inside one range. The lock is
//! released when the guard drops.

use std::fs::File;
use std::io;

pub struct RangeLock<'a> {
    file: &'a File,
    offset: u64,
    length: u64,
}

impl<'a> RangeLock<'a> {
    /// Block until `[offset, offset + length)` of `file` is exclusively ours.
    pub fn acquire(file: &'a File, offset: u64, length: u64) -> io::Result<Self> {
        if length > 0 {
            sys::lock(file, offset, length)?;
        }
        Ok(Self {
            file,
            offset,
            length,
        })
    }
}

impl Drop for RangeLock<'_> {
    fn drop(&mut self) {
        if self.length > 0 {
            let _ = sys::unlock(self.file, self.offset, self.length);
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    // Open-file-description locks conflict between handles of one process;
    // classic POSIX locks only conflict between processes.
    #[cfg(target_os = "linux")]
    const SET_LOCK_WAIT: libc::c_int = libc::F_OFD_SETLKW;
    #[cfg(not(target_os = "linux"))]
    const SET_LOCK_WAIT: libc::c_int = libc::F_SETLKW;

    fn fcntl_lock(file: &File, kind: libc::c_short, offset: u64, length: u64) -> io::Result<()> {
        // l_pid must be zero for OFD locks
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = kind;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = offset as libc::off_t;
        fl.l_len = length as libc::off_t;
        loop {
            let r = unsafe { libc::fcntl(file.as_raw_fd(), SET_LOCK_WAIT, &mut fl) };
            if r != -1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    pub fn lock(file: &File, offset: u64, length: u64) -> io::Result<()> {
        fcntl_lock(file, libc::F_WRLCK as libc::c_short, offset, length)
    }

    pub fn unlock(file: &File, offset: u64, length: u64) -> io::Result<()> {
        fcntl_lock(file, libc::F_UNLCK as libc::c_short, offset, length)
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK};
    use windows::Win32::System::IO::OVERLAPPED;

    fn overlapped_at(offset: u64) -> OVERLAPPED {
        let mut ov = OVERLAPPED::default();
        ov.Anonymous.Anonymous.Offset = offset as u32;
        ov.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
        ov
    }

    pub fn lock(file: &File, offset: u64, length: u64) -> io::Result<()> {
        let mut ov = overlapped_at(offset);
        unsafe {
            LockFileEx(
                HANDLE(file.as_raw_handle() as isize),
                LOCKFILE_EXCLUSIVE_LOCK,
                0,
                length as u32,
                (length >> 32) as u32,
                &mut ov,
            )
        }
        .map_err(|e| io::Error::other(e.to_string()))
    }

    pub fn unlock(file: &File, offset: u64, length: u64) -> io::Result<()> {
        let mut ov = overlapped_at(offset);
        unsafe {
            UnlockFileEx(
                HANDLE(file.as_raw_handle() as isize),
                0,
                length as u32,
                (length >> 32) as u32,
                &mut ov,
            )
        }
        .map_err(|e| io::Error::other(e.to_string()))
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::fs::File;
    use std::io;

    pub fn lock(_file: &File, _offset: u64, _length: u64) -> io::Result<()> {
        Ok(())
    }

    pub fn unlock(_file: &File, _offset: u64, _length: u64) -> io::Result<()> {
        Ok(())
    }
}
