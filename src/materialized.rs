use crate::error::Result;
use crate::storage::models::{SeveritySnapshot, StatusSnapshot};
use crate::storage::{queries, Database};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

pub const KIND_STATUS: &str = "status";
pub const KIND_SEVERITY: &str = "severity";

/// Recomputes every snapshot row from the base tables. Runs inside the
/// committing transaction of an epoch's final flush, so readers always see
/// snapshots consistent with the facts that produced them.
pub fn refresh_all(conn: &Connection) -> Result<()> {
    queries::refresh_file_counts(conn)?;

    let status = compute_status(conn)?;
    let severity = compute_severity(conn)?;
    let now = chrono::Utc::now().timestamp();

    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO snapshots (kind, payload, refreshed_at) VALUES (?1, ?2, ?3)",
    )?;
    stmt.execute(params![KIND_STATUS, serde_json::to_string(&status)?, now])?;
    stmt.execute(params![KIND_SEVERITY, serde_json::to_string(&severity)?, now])?;

    debug!(
        "Snapshots refreshed: {} files, {} violations, health {:.1}",
        status.files, status.violations, status.health_score
    );
    Ok(())
}

fn compute_status(conn: &Connection) -> Result<StatusSnapshot> {
    let (files, patterns, call_edges): (i64, i64, i64) = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM file_metadata), \
                (SELECT COUNT(*) FROM patterns), \
                (SELECT COUNT(*) FROM call_edges)",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    let (violations, suppressed): (i64, i64) = conn.query_row(
        "SELECT COUNT(*) FILTER (WHERE suppressed = 0), \
                COUNT(*) FILTER (WHERE suppressed = 1) \
         FROM violations",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(StatusSnapshot {
        files,
        patterns,
        call_edges,
        violations,
        suppressed,
        health_score: health_score(conn, files)?,
    })
}

/// Health starts at 100 and loses weighted points per unsuppressed
/// violation, scaled by store size so large trees are not penalized for
/// absolute counts. Clamped to [0, 100].
fn health_score(conn: &Connection, files: i64) -> Result<f64> {
    if files == 0 {
        return Ok(100.0);
    }
    let weighted: f64 = conn.query_row(
        "SELECT COALESCE(SUM(CASE severity \
              WHEN 'critical' THEN 5.0 \
              WHEN 'high' THEN 3.0 \
              WHEN 'medium' THEN 1.0 \
              ELSE 0.5 END), 0.0) \
         FROM violations WHERE suppressed = 0",
        [],
        |row| row.get(0),
    )?;
    let score = 100.0 - 100.0 * weighted / (weighted + files as f64);
    Ok(score.clamp(0.0, 100.0))
}

fn compute_severity(conn: &Connection) -> Result<SeveritySnapshot> {
    let mut snapshot = SeveritySnapshot {
        critical: 0,
        high: 0,
        medium: 0,
        low: 0,
    };
    let mut stmt = conn.prepare(
        "SELECT severity, COUNT(*) FROM violations WHERE suppressed = 0 GROUP BY severity",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (severity, count) = row?;
        match severity.as_str() {
            "critical" => snapshot.critical = count,
            "high" => snapshot.high = count,
            "medium" => snapshot.medium = count,
            _ => snapshot.low += count,
        }
    }
    Ok(snapshot)
}

impl Database {
    pub fn status_snapshot(&self) -> Result<Option<StatusSnapshot>> {
        self.snapshot_payload(KIND_STATUS)
    }

    pub fn severity_snapshot(&self) -> Result<Option<SeveritySnapshot>> {
        self.snapshot_payload(KIND_SEVERITY)
    }

    fn snapshot_payload<T: serde::de::DeserializeOwned>(&self, kind: &str) -> Result<Option<T>> {
        let payload: Option<String> = self.with_reader(|conn| {
            let payload = conn
                .query_row(
                    "SELECT payload FROM snapshots WHERE kind = ?1",
                    params![kind],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(payload)
        })?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
