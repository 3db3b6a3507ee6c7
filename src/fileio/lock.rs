use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::FileLock;
use crate::error::Result;

/// Advisory lock held through an open descriptor on the lock file.
///
/// Dropping it closes the descriptor, which releases the lock as well.
#[derive(Debug)]
pub(crate) struct OsLock {
    path: PathBuf,
    fd: fs::File,
}

impl OsLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        // A missing parent directory surfaces as a plain I/O error.
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        platform::lock(&fd, path)?;
        debug!(path = %path.display(), "acquired file lock");

        Ok(OsLock {
            path: path.to_path_buf(),
            fd,
        })
    }
}

impl FileLock for OsLock {
    fn release(self: Box<Self>) -> Result<()> {
        let OsLock { path, fd } = *self;
        platform::unlock(&fd)?;
        debug!(path = %path.display(), "released file lock");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::fs;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    use crate::error::{Error, Result};

    fn set_lock(fd: &fs::File, kind: libc::c_int) -> io::Result<()> {
        // SAFETY: an all-zero flock is a valid value; the fields that matter are set below.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = kind as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = 0;
        fl.l_len = 0; // whole file

        // SAFETY: fd is a live descriptor owned by `fd`, and fl outlives the call.
        let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETLK, &fl as *const libc::flock) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn lock(fd: &fs::File, path: &Path) -> Result<()> {
        set_lock(fd, libc::F_WRLCK).map_err(|e| match e.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EAGAIN) => Error::LockHeld(path.to_path_buf()),
            _ => Error::Io(e),
        })
    }

    pub(super) fn unlock(fd: &fs::File) -> Result<()> {
        Ok(set_lock(fd, libc::F_UNLCK)?)
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::fs;
    use std::path::Path;

    use crate::error::{Error, Result};

    pub(super) fn lock(_fd: &fs::File, _path: &Path) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub(super) fn unlock(_fd: &fs::File) -> Result<()> {
        Err(Error::Unsupported)
    }
}
