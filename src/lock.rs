use crate::error::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Contents of the sentinel file. Advisory: the OS lock is what actually
/// excludes writers, the pid is for diagnostics and error messages.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: String,
}

/// Cross-process write-epoch guard: an exclusive advisory lock on a
/// sentinel file beside the database. The OS releases it when the holder
/// exits, crashed or not, so a crash never leaves the store unwritable.
///
/// The sentinel persists across epochs. Unlinking it on release would let
/// a racer lock an orphaned inode while a third process locks a fresh one
/// at the same path, yielding two holders.
pub struct ProcessLock {
    file: File,
}

impl ProcessLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            let holder_pid = read_holder_pid(&mut file).unwrap_or(0);
            return Err(Error::ConcurrentWriter { holder_pid });
        }

        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().to_rfc3339(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        serde_json::to_writer(&file, &info)?;
        file.flush()?;

        debug!("Acquired epoch lock at {} (pid {})", path.display(), info.pid);
        Ok(ProcessLock { file })
    }

    /// A sentinel with no live holder: present on disk but immediately
    /// lockable. Live holders make this return false.
    pub fn is_stale(path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = fs2::FileExt::unlock(&file);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Removes a stale sentinel. Refuses if a live process still holds it.
    pub fn break_stale(path: &Path) -> Result<()> {
        if !Self::is_stale(path)? {
            let mut file = OpenOptions::new().read(true).open(path)?;
            let holder_pid = read_holder_pid(&mut file).unwrap_or(0);
            return Err(Error::ConcurrentWriter { holder_pid });
        }
        std::fs::remove_file(path)?;
        warn!("Removed stale epoch lock at {}", path.display());
        Ok(())
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn read_holder_pid(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    let info: LockInfo = serde_json::from_str(&contents).ok()?;
    Some(info.pid)
}
