use super::migrations;
use crate::error::{Error, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Connection manager: one read/write connection behind a mutex plus a
/// fixed pool of read-only connections. WAL mode lets the readers run
/// concurrently with the single writer without observing uncommitted rows.
pub struct Database {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: &Path, read_pool_size: usize, busy_timeout_ms: u64) -> Result<Self> {
        let writer = Connection::open(path)?;
        configure_pragmas(&writer, busy_timeout_ms)?;
        migrations::apply_pending(&writer)?;
        verify_quick_check(&writer)?;

        let mut readers = Vec::with_capacity(read_pool_size);
        for _ in 0..read_pool_size {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.execute_batch(&format!("PRAGMA busy_timeout = {};", busy_timeout_ms))?;
            readers.push(Mutex::new(conn));
        }
        debug!(
            "Opened store at {} with {} read-only connections",
            path.display(),
            read_pool_size
        );

        Ok(Database {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            path: Some(path.to_path_buf()),
        })
    }

    /// Single-connection store for tests. Read-only pooling needs a file,
    /// so reads fall back to the write connection here.
    pub fn open_in_memory() -> Result<Self> {
        let writer = Connection::open_in_memory()?;
        configure_pragmas(&writer, 5000)?;
        migrations::apply_pending(&writer)?;
        Ok(Database {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` with the write connection held exclusively.
    pub fn with_writer<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = lock_recovering(&self.writer);
        f(&guard)
    }

    /// Runs `f` on a pooled read-only connection, round-robin. Readers in
    /// WAL mode see the last committed state only.
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.readers.is_empty() {
            return self.with_writer(f);
        }
        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let guard = lock_recovering(&self.readers[slot]);
        f(&guard)
    }

    /// Full integrity sweep: `PRAGMA quick_check` plus orphaned foreign
    /// keys. Cheap enough to run at open and after restore.
    pub fn integrity_report(&self) -> Result<IntegrityReport> {
        self.with_writer(|conn| {
            let mut errors = Vec::new();
            let mut stmt = conn.prepare("PRAGMA quick_check")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let line = row?;
                if line != "ok" {
                    errors.push(line);
                }
            }

            let mut fk_stmt = conn.prepare("PRAGMA foreign_key_check")?;
            let fk_count = fk_stmt.query_map([], |_| Ok(()))?.count() as i64;

            Ok(IntegrityReport {
                ok: errors.is_empty() && fk_count == 0,
                errors,
                foreign_key_violations: fk_count,
            })
        })
    }

    /// Truncates the WAL and drops every connection. The resulting files
    /// are safe to copy or swap.
    pub fn close(self) -> Result<()> {
        {
            let guard = lock_recovering(&self.writer);
            if let Err(e) = guard.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                warn!("Checkpoint on close failed: {}", e);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub ok: bool,
    pub errors: Vec<String>,
    pub foreign_key_violations: i64,
}

fn configure_pragmas(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA cache_size = -64000;
         PRAGMA mmap_size = 268435456;
         PRAGMA wal_autocheckpoint = 1000;
         PRAGMA busy_timeout = {};",
        busy_timeout_ms
    ))?;
    debug!("SQLite pragmas configured (WAL mode, 64MB cache, 256MB mmap)");
    Ok(())
}

fn verify_quick_check(conn: &Connection) -> Result<()> {
    let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if verdict == "ok" {
        Ok(())
    } else {
        Err(Error::Corrupt(verdict))
    }
}

/// A poisoned mutex only means another thread panicked mid-operation; the
/// connection itself is still usable, so recover the guard.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
