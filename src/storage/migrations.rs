use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// One schema step. The list below is append-only: shipped steps are never
/// edited or reordered, and steps never drop or rewrite existing columns.
pub struct Migration {
    pub version: i64,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "CREATE TABLE file_metadata (
                  path            TEXT PRIMARY KEY,
                  language        TEXT NOT NULL DEFAULT '',
                  file_size       INTEGER NOT NULL,
                  mtime_secs      INTEGER NOT NULL,
                  mtime_nanos     INTEGER NOT NULL,
                  content_hash    BLOB NOT NULL,
                  last_scanned_at INTEGER NOT NULL,
                  pattern_count   INTEGER NOT NULL DEFAULT 0,
                  edge_count      INTEGER NOT NULL DEFAULT 0,
                  violation_count INTEGER NOT NULL DEFAULT 0
              );
              CREATE TABLE patterns (
                  id         INTEGER PRIMARY KEY AUTOINCREMENT,
                  file       TEXT NOT NULL REFERENCES file_metadata(path) ON DELETE CASCADE,
                  kind       TEXT NOT NULL,
                  name       TEXT NOT NULL,
                  line       INTEGER NOT NULL,
                  confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
                  created_at INTEGER NOT NULL
              );
              CREATE TABLE call_edges (
                  id         INTEGER PRIMARY KEY AUTOINCREMENT,
                  file       TEXT NOT NULL REFERENCES file_metadata(path) ON DELETE CASCADE,
                  caller     TEXT NOT NULL,
                  callee     TEXT NOT NULL,
                  line       INTEGER NOT NULL,
                  kind       TEXT NOT NULL,
                  created_at INTEGER NOT NULL
              );
              CREATE TABLE violations (
                  id         TEXT PRIMARY KEY,
                  file       TEXT NOT NULL REFERENCES file_metadata(path) ON DELETE CASCADE,
                  line       INTEGER NOT NULL,
                  severity   TEXT NOT NULL,
                  rule       TEXT NOT NULL,
                  message    TEXT NOT NULL,
                  suppressed INTEGER NOT NULL DEFAULT 0,
                  created_at INTEGER NOT NULL
              );
              CREATE TABLE scan_history (
                  id             INTEGER PRIMARY KEY AUTOINCREMENT,
                  root_path      TEXT NOT NULL,
                  started_at     INTEGER NOT NULL,
                  completed_at   INTEGER,
                  files_scanned  INTEGER NOT NULL DEFAULT 0,
                  files_changed  INTEGER NOT NULL DEFAULT 0,
                  files_removed  INTEGER NOT NULL DEFAULT 0,
                  status         TEXT NOT NULL DEFAULT 'running'
              );",
    },
    Migration {
        version: 2,
        sql: "CREATE INDEX idx_patterns_file ON patterns(file);
              CREATE INDEX idx_call_edges_file ON call_edges(file);
              CREATE INDEX idx_call_edges_callee ON call_edges(callee);
              CREATE INDEX idx_violations_file ON violations(file);
              CREATE INDEX idx_violations_severity ON violations(severity);
              CREATE TABLE backup_history (
                  id         INTEGER PRIMARY KEY AUTOINCREMENT,
                  dest_path  TEXT NOT NULL,
                  reason     TEXT NOT NULL,
                  checksum   TEXT NOT NULL,
                  size_bytes INTEGER NOT NULL,
                  created_at TEXT NOT NULL,
                  verified   INTEGER NOT NULL DEFAULT 0
              );",
    },
    Migration {
        version: 3,
        sql: "CREATE TABLE snapshots (
                  kind         TEXT PRIMARY KEY,
                  payload      TEXT NOT NULL,
                  refreshed_at INTEGER NOT NULL
              );",
    },
    Migration {
        version: 4,
        sql: "ALTER TABLE file_metadata ADD COLUMN scan_duration_us INTEGER NOT NULL DEFAULT 0;",
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Applies every step newer than `user_version` inside one transaction.
/// A failing step rolls the whole set back and leaves the store at its
/// prior version. Returns the number of steps applied (0 when current).
pub fn apply_pending(conn: &Connection) -> Result<usize> {
    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        debug!("Schema current at version {}", current);
        return Ok(0);
    }

    let target = latest_version();
    info!(
        "Migrating schema from version {} to {} ({} steps)",
        current,
        target,
        pending.len()
    );

    let tx = conn.unchecked_transaction()?;
    for migration in &pending {
        tx.execute_batch(migration.sql)
            .map_err(|e| Error::Migration {
                version: migration.version,
                detail: e.to_string(),
            })?;
        debug!("Applied schema version {}", migration.version);
    }
    tx.pragma_update(None, "user_version", target)
        .map_err(|e| Error::Migration {
            version: target,
            detail: e.to_string(),
        })?;
    tx.commit().map_err(|e| Error::Migration {
        version: target,
        detail: e.to_string(),
    })?;

    Ok(pending.len())
}
