use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::MailsiftError;

/// Exclusive advisory lock on the state directory, held for one sync cycle.
///
/// The OS releases the lock when the file handle closes, so a crashed
/// process never leaves a stale lock behind.
#[derive(Debug)]
pub struct SyncLock {
    file: File,
    path: PathBuf,
}

impl SyncLock {
    pub fn acquire(path: &Path) -> Result<Self, MailsiftError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive().map_err(|e| {
            MailsiftError::Locked(format!(
                "{} is held by another sync ({})",
                path.display(),
                e
            ))
        })?;

        // Owner metadata, for humans inspecting the file
        file.set_len(0)?;
        writeln!(file, "pid={}", std::process::id())?;

        debug!(path = %path.display(), "Acquired sync lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "Released sync lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.lock");
        let first = SyncLock::acquire(&path).unwrap();
        let second = SyncLock::acquire(&path);
        assert!(matches!(second, Err(MailsiftError::Locked(_))));
        drop(first);
        assert!(SyncLock::acquire(&path).is_ok());
    }
}
