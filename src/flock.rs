use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive lock on the data directory's `LOCK` file. Only one process may
/// open a given data directory; the lock is released when this is dropped.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates a new FileLock and locks the file.
    /// The lock file contains the process ID for debugging purposes.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        // Write process ID to the lock file for debugging
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // Fallback for other platforms - just succeed
        Ok(())
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The lock
        // file itself is left on disk to avoid unlink races with a second
        // process waiting on it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lock_writes_pid() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("LOCK");

        let lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");

        assert!(lock_path.exists());
        let content = fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));
        assert_eq!(lock.path(), lock_path.as_path());
    }

    #[test]
    fn test_double_lock() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("LOCK");

        let _lock1 = FileLock::lock(&lock_path).expect("Failed to acquire first lock");

        // A second lock on the same file must fail while the first is held.
        assert!(FileLock::lock(&lock_path).is_err());
    }

    #[test]
    fn test_auto_unlock_on_drop() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("LOCK");

        {
            let _lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
            assert!(lock_path.exists());
        }

        // After the lock goes out of scope it can be acquired again, even
        // though the file is still on disk.
        let _lock2 = FileLock::lock(&lock_path).expect("Should re-acquire lock after drop");
    }
}
