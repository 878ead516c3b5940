#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{ArbolError, Result};

/// Name of the lock file inside a data directory.
pub const LOCK_FILE_NAME: &str = "arbol.lck";

/// Canonical data directories claimed by this process.
///
/// fcntl record locks belong to the process, not to the open file: a second
/// lock from the same process on the same file always succeeds, and closing
/// any descriptor of the lock file drops every lock the process holds on it.
/// A per-store registry could not see a second pool opened elsewhere in the
/// process, so the claim set is process-wide, and it is consulted before the
/// lock file is opened so a refused claim never closes a descriptor that
/// would release the holder's lock.
static LOCKED_DIRS: Mutex<Vec<PathBuf>> = parking_lot::const_mutex(Vec::new());

/// Exclusive claim on a data directory, held for the lifetime of a pool.
pub struct DataDirLock {
    file: File,
    dir: PathBuf,
}

impl DataDirLock {
    /// Locks `dir`, failing immediately if another pool or process holds it.
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let dir = dir.canonicalize()?;
        let mut locked = LOCKED_DIRS.lock();
        if locked.contains(&dir) {
            return Err(ArbolError::InvalidOwned(format!(
                "data directory {} is already open in this process",
                dir.display()
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE_NAME))?;
        if file.metadata()?.len() < 1 {
            file.set_len(1)?;
        }
        if !lock_region(&file, 0, 1)? {
            return Err(ArbolError::InvalidOwned(format!(
                "data directory {} is locked by another process",
                dir.display()
            )));
        }
        locked.push(dir.clone());
        debug!(dir = %dir.display(), "dirlock.acquired");
        Ok(Self { file, dir })
    }

    /// The locked directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(err) = unlock_region(&self.file, 0, 1) {
            debug!(error = %err, "dirlock.unlock_failed");
        }
        LOCKED_DIRS.lock().retain(|dir| dir != &self.dir);
        debug!(dir = %self.dir.display(), "dirlock.released");
    }
}

fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, len)
    }
    #[cfg(windows)]
    {
        windows::lock_region(file, start, len)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Ok(true)
    }
}

fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file, start, len)
    }
    #[cfg(windows)]
    {
        windows::unlock_region(file, start, len)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn flock(kind: libc::c_int, start: u64, len: u64) -> libc::flock {
        // Some platforms carry extra fields, so start from zeroed memory.
        let mut flock: libc::flock = unsafe { std::mem::zeroed() };
        flock.l_type = kind as _;
        flock.l_whence = libc::SEEK_SET as _;
        flock.l_start = start as libc::off_t;
        flock.l_len = len as libc::off_t;
        flock
    }

    pub fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut lock = flock(libc::F_WRLCK as libc::c_int, start, len);
        loop {
            let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut lock = flock(libc::F_UNLCK as libc::c_int, start, len);
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Offset = start as u32;
            overlapped.OffsetHigh = (start >> 32) as u32;
            let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
            let res = LockFileEx(
                handle as isize,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if matches!(err.raw_os_error(), Some(code) if code == ERROR_LOCK_VIOLATION as i32) {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Offset = start as u32;
            overlapped.OffsetHigh = (start >> 32) as u32;
            let res = UnlockFileEx(handle as isize, 0, len as u32, (len >> 32) as u32, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
