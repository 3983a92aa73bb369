//! Advisory lock on a cache directory (`<dir>/fs.lock`).
//!
//! Two processes sharing a cache directory would interleave appends to the
//! same Blocks Files; the lock makes the second `open` fail instead.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::{BfsError, Result};

pub const LOCK_FILE_NAME: &str = "fs.lock";

/// Exclusive `flock` held until dropped.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    file: File,
}

impl DirLock {
    /// Take the lock without blocking.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { path, file }),
            Err(e) if is_contended(&e) => Err(BfsError::Locked { path }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_fails() {
        let temp = TempDir::new().unwrap();
        let lock = DirLock::acquire(temp.path()).unwrap();
        assert!(lock.path().ends_with(LOCK_FILE_NAME));
        assert!(matches!(
            DirLock::acquire(temp.path()),
            Err(BfsError::Locked { .. })
        ));

        lock.release().unwrap();
        DirLock::acquire(temp.path()).unwrap();
    }
}
