use crate::error::Result;
use crate::storage::Database;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of a `wal_checkpoint` call, straight from SQLite: whether a
/// lock prevented completion, frames in the WAL, and frames checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReport {
    pub busy: bool,
    pub wal_frames: i64,
    pub checkpointed_frames: i64,
}

impl Database {
    /// Non-blocking checkpoint; skips whatever readers still pin.
    pub fn checkpoint_passive(&self) -> Result<CheckpointReport> {
        self.run_checkpoint("PASSIVE")
    }

    /// Blocking checkpoint that also truncates the WAL file. Runs at epoch
    /// end so the WAL never grows across idle periods.
    pub fn checkpoint_truncate(&self) -> Result<CheckpointReport> {
        self.run_checkpoint("TRUNCATE")
    }

    fn run_checkpoint(&self, mode: &str) -> Result<CheckpointReport> {
        self.with_writer(|conn| {
            let (busy, wal_frames, checkpointed_frames): (i64, i64, i64) = conn.query_row(
                &format!("PRAGMA wal_checkpoint({})", mode),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let report = CheckpointReport {
                busy: busy != 0,
                wal_frames,
                checkpointed_frames,
            };
            debug!(
                "wal_checkpoint({}): busy={} frames={} checkpointed={}",
                mode, report.busy, report.wal_frames, report.checkpointed_frames
            );
            Ok(report)
        })
    }

    /// Size of the `-wal` sidecar on disk, 0 when absent or in-memory.
    pub fn wal_size(&self) -> u64 {
        self.path()
            .map(wal_path)
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Emergency valve: when the WAL outgrows the limit (a long-running
    /// reader can pin it), force a truncate checkpoint.
    pub fn enforce_wal_limit(&self, limit_bytes: u64) -> Result<Option<CheckpointReport>> {
        let size = self.wal_size();
        if size <= limit_bytes {
            return Ok(None);
        }
        warn!(
            "WAL at {} bytes exceeds the {} byte limit; forcing truncate checkpoint",
            size, limit_bytes
        );
        let report = self.checkpoint_truncate()?;
        if report.busy {
            warn!("Emergency checkpoint could not complete; a reader holds the WAL");
        }
        Ok(Some(report))
    }

    /// Fraction of the database file occupied by free pages.
    pub fn free_page_ratio(&self) -> Result<f64> {
        self.with_writer(|conn| {
            let freelist: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
            let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            if pages == 0 {
                return Ok(0.0);
            }
            Ok(freelist as f64 / pages as f64)
        })
    }

    /// Runs VACUUM when fragmentation crosses `threshold`. Returns whether
    /// it ran. VACUUM rewrites the whole file, so it only fires after
    /// retention or bulk deletes leave real waste behind.
    pub fn vacuum_if_fragmented(&self, threshold: f64) -> Result<bool> {
        let ratio = self.free_page_ratio()?;
        if ratio < threshold {
            debug!(
                "Free page ratio {:.3} below threshold {:.3}; skipping VACUUM",
                ratio, threshold
            );
            return Ok(false);
        }
        info!(
            "Free page ratio {:.3} at or above threshold {:.3}; running VACUUM",
            ratio, threshold
        );
        self.with_writer(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })?;
        Ok(true)
    }
}

fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-wal");
    PathBuf::from(name)
}
