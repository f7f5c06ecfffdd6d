use crate::config::RetentionPolicy;
use crate::error::Result;
use crate::materialized;
use crate::storage::Database;
use rusqlite::params;
use std::time::Instant;
use tracing::info;

/// Per-table delete counts from one retention pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionReport {
    pub violations_deleted: usize,
    pub scans_deleted: usize,
    pub backups_deleted: usize,
    pub orphans_deleted: usize,
    pub duration_secs: f64,
}

/// Age-based cleanup of derived rows, all in one transaction. Violations
/// use the short window, history tables the long one. Orphan cleanup is a
/// guard against rows that lost their file outside the cascade path.
/// Snapshots and per-file counters are recomputed in the same transaction
/// so readers never see a summary of the pre-retention state.
pub fn apply(db: &Database, policy: &RetentionPolicy) -> Result<RetentionReport> {
    let start = Instant::now();
    let now = chrono::Utc::now().timestamp();
    let violation_cutoff = now - policy.violation_days * 86_400;
    let history_cutoff = now - policy.history_days * 86_400;
    let history_cutoff_rfc3339 = chrono::DateTime::from_timestamp(history_cutoff, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    let mut report = db.with_writer(|conn| {
        let tx = conn.unchecked_transaction()?;
        let mut report = RetentionReport::default();

        report.violations_deleted = tx.execute(
            "DELETE FROM violations WHERE created_at < ?1",
            params![violation_cutoff],
        )?;
        report.scans_deleted = tx.execute(
            "DELETE FROM scan_history WHERE started_at < ?1",
            params![history_cutoff],
        )?;
        report.backups_deleted = tx.execute(
            "DELETE FROM backup_history WHERE created_at < ?1",
            params![history_cutoff_rfc3339],
        )?;

        report.orphans_deleted = tx.execute(
            "DELETE FROM patterns WHERE file NOT IN (SELECT path FROM file_metadata)",
            [],
        )?;
        report.orphans_deleted += tx.execute(
            "DELETE FROM call_edges WHERE file NOT IN (SELECT path FROM file_metadata)",
            [],
        )?;
        report.orphans_deleted += tx.execute(
            "DELETE FROM violations WHERE file NOT IN (SELECT path FROM file_metadata)",
            [],
        )?;

        materialized::refresh_all(&tx)?;
        tx.commit()?;
        Ok(report)
    })?;

    report.duration_secs = start.elapsed().as_secs_f64();
    info!(
        "Retention pass in {:.2}s: {} violations, {} scans, {} backups, {} orphans",
        report.duration_secs,
        report.violations_deleted,
        report.scans_deleted,
        report.backups_deleted,
        report.orphans_deleted,
    );
    Ok(report)
}
