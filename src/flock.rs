//! Exclusive lock on a database directory.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

/// Holds an exclusive `flock` on a file inside the database directory for as
/// long as it lives. The file records the owning process id.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates (or reuses) the lock file at `path` and locks it without
    /// blocking. Fails with `LockError` if another process holds it.
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(Error::LockError)?;

        try_lock(&file).map_err(Error::LockError)?;

        file.set_len(0).map_err(Error::LockError)?;
        writeln!(file, "{}", std::process::id()).map_err(Error::LockError)?;
        file.flush().map_err(Error::LockError)?;

        tracing::debug!(path = %path.display(), "Acquired directory lock");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn try_lock(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_EX, LOCK_NB};

    let fd = file.as_raw_fd();
    let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
