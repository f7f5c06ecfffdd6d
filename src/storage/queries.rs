use super::models::*;
use super::sqlite::Database;
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

// ── Write path ───────────────────────────────────────────────
//
// These run inside the batch writer's savepoints, so they take the raw
// connection and never open their own transaction. A failing row maps to
// Rejected naming the domain and row index so the producer can pinpoint it.

fn rejected(domain: &'static str, row: usize) -> impl FnOnce(rusqlite::Error) -> Error {
    move |e| Error::Rejected {
        domain,
        row,
        detail: e.to_string(),
    }
}

pub fn insert_files(conn: &Connection, rows: &[FileRecord]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO file_metadata \
         (path, language, file_size, mtime_secs, mtime_nanos, content_hash, \
          last_scanned_at, scan_duration_us, pattern_count, edge_count, violation_count) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
         ON CONFLICT(path) DO UPDATE SET \
             language = excluded.language, \
             file_size = excluded.file_size, \
             mtime_secs = excluded.mtime_secs, \
             mtime_nanos = excluded.mtime_nanos, \
             content_hash = excluded.content_hash, \
             last_scanned_at = excluded.last_scanned_at, \
             scan_duration_us = excluded.scan_duration_us",
    )?;
    for (i, file) in rows.iter().enumerate() {
        stmt.execute(params![
            file.path,
            file.language,
            file.file_size,
            file.mtime_secs,
            file.mtime_nanos,
            file.content_hash,
            file.last_scanned_at,
            file.scan_duration_us,
            file.pattern_count,
            file.edge_count,
            file.violation_count,
        ])
        .map_err(rejected("file_metadata", i))?;
    }
    Ok(rows.len())
}

pub fn insert_patterns(conn: &Connection, rows: &[PatternRecord]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO patterns (file, kind, name, line, confidence, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (i, p) in rows.iter().enumerate() {
        stmt.execute(params![p.file, p.kind, p.name, p.line, p.confidence, p.created_at])
            .map_err(rejected("patterns", i))?;
    }
    Ok(rows.len())
}

pub fn insert_call_edges(conn: &Connection, rows: &[CallEdgeRecord]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO call_edges (file, caller, callee, line, kind, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (i, e) in rows.iter().enumerate() {
        stmt.execute(params![e.file, e.caller, e.callee, e.line, e.kind, e.created_at])
            .map_err(rejected("call_edges", i))?;
    }
    Ok(rows.len())
}

pub fn insert_violations(conn: &Connection, rows: &[ViolationRecord]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO violations \
         (id, file, line, severity, rule, message, suppressed, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (i, v) in rows.iter().enumerate() {
        stmt.execute(params![
            v.id,
            v.file,
            v.line,
            v.severity,
            v.rule,
            v.message,
            v.suppressed,
            v.created_at,
        ])
        .map_err(rejected("violations", i))?;
    }
    Ok(rows.len())
}

/// Deletes file rows; derived patterns, edges and violations cascade.
pub fn remove_files(conn: &Connection, paths: &[String]) -> Result<usize> {
    let mut stmt = conn.prepare_cached("DELETE FROM file_metadata WHERE path = ?1")?;
    let mut removed = 0;
    for (i, path) in paths.iter().enumerate() {
        removed += stmt.execute(params![path]).map_err(rejected("remove_files", i))?;
    }
    Ok(removed)
}

pub fn insert_scans(conn: &Connection, rows: &[ScanRecord]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO scan_history \
         (root_path, started_at, completed_at, files_scanned, files_changed, files_removed, status) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for (i, s) in rows.iter().enumerate() {
        stmt.execute(params![
            s.root_path,
            s.started_at,
            s.completed_at,
            s.files_scanned,
            s.files_changed,
            s.files_removed,
            s.status,
        ])
        .map_err(rejected("scan_history", i))?;
    }
    Ok(rows.len())
}

pub fn insert_backup_record(conn: &Connection, record: &BackupRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO backup_history (dest_path, reason, checksum, size_bytes, created_at, verified) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.dest_path,
            record.reason,
            record.checksum,
            record.size_bytes,
            record.created_at,
            record.verified,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Refreshes the derived per-file counters from the base tables. Runs in
/// the epoch's committing transaction, next to the snapshot refresh.
pub fn refresh_file_counts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "UPDATE file_metadata SET
             pattern_count   = (SELECT COUNT(*) FROM patterns p WHERE p.file = file_metadata.path),
             edge_count      = (SELECT COUNT(*) FROM call_edges e WHERE e.file = file_metadata.path),
             violation_count = (SELECT COUNT(*) FROM violations v WHERE v.file = file_metadata.path);",
    )?;
    Ok(())
}

// ── Read path ────────────────────────────────────────────────

impl Database {
    /// All known file stamps, keyed by path. Drives change detection.
    pub fn load_stamps(&self) -> Result<HashMap<String, StoredStamp>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT path, file_size, mtime_secs, mtime_nanos, content_hash FROM file_metadata",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    StoredStamp {
                        file_size: row.get(1)?,
                        mtime_secs: row.get(2)?,
                        mtime_nanos: row.get(3)?,
                        content_hash: row.get(4)?,
                    },
                ))
            })?;
            let mut stamps = HashMap::new();
            for row in rows {
                let (path, stamp) = row?;
                stamps.insert(path, stamp);
            }
            Ok(stamps)
        })
    }

    pub fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        self.with_reader(|conn| {
            let record = conn
                .query_row(
                    "SELECT path, language, file_size, mtime_secs, mtime_nanos, content_hash, \
                            last_scanned_at, scan_duration_us, pattern_count, edge_count, \
                            violation_count \
                     FROM file_metadata WHERE path = ?1",
                    params![path],
                    |row| {
                        Ok(FileRecord {
                            path: row.get(0)?,
                            language: row.get(1)?,
                            file_size: row.get(2)?,
                            mtime_secs: row.get(3)?,
                            mtime_nanos: row.get(4)?,
                            content_hash: row.get(5)?,
                            last_scanned_at: row.get(6)?,
                            scan_duration_us: row.get(7)?,
                            pattern_count: row.get(8)?,
                            edge_count: row.get(9)?,
                            violation_count: row.get(10)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }

    /// Keyset pagination over patterns, ordered by id. OFFSET degrades as
    /// the table grows, so pages resume from the last seen id instead.
    pub fn list_patterns(&self, after: Option<i64>, limit: i64) -> Result<Page<PatternRecord, i64>> {
        self.with_reader(|conn| {
            let cursor = after.unwrap_or(0);
            let mut stmt = conn.prepare_cached(
                "SELECT id, file, kind, name, line, confidence, created_at \
                 FROM patterns WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let items = stmt
                .query_map(params![cursor, limit], |row| {
                    Ok(PatternRecord {
                        id: row.get(0)?,
                        file: row.get(1)?,
                        kind: row.get(2)?,
                        name: row.get(3)?,
                        line: row.get(4)?,
                        confidence: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let next_cursor = next_cursor_i64(&items, limit, |p| p.id);
            Ok(Page { items, next_cursor })
        })
    }

    pub fn list_call_edges(
        &self,
        after: Option<i64>,
        limit: i64,
    ) -> Result<Page<CallEdgeRecord, i64>> {
        self.with_reader(|conn| {
            let cursor = after.unwrap_or(0);
            let mut stmt = conn.prepare_cached(
                "SELECT id, file, caller, callee, line, kind, created_at \
                 FROM call_edges WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let items = stmt
                .query_map(params![cursor, limit], |row| {
                    Ok(CallEdgeRecord {
                        id: row.get(0)?,
                        file: row.get(1)?,
                        caller: row.get(2)?,
                        callee: row.get(3)?,
                        line: row.get(4)?,
                        kind: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let next_cursor = next_cursor_i64(&items, limit, |e| e.id);
            Ok(Page { items, next_cursor })
        })
    }

    pub fn list_violations(
        &self,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Page<ViolationRecord, String>> {
        self.with_reader(|conn| {
            let cursor = after.unwrap_or("");
            let mut stmt = conn.prepare_cached(
                "SELECT id, file, line, severity, rule, message, suppressed, created_at \
                 FROM violations WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let items = stmt
                .query_map(params![cursor, limit], |row| {
                    Ok(ViolationRecord {
                        id: row.get(0)?,
                        file: row.get(1)?,
                        line: row.get(2)?,
                        severity: row.get(3)?,
                        rule: row.get(4)?,
                        message: row.get(5)?,
                        suppressed: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let next_cursor = if items.len() as i64 == limit {
                items.last().map(|v| v.id.clone())
            } else {
                None
            };
            Ok(Page { items, next_cursor })
        })
    }

    pub fn patterns_for_file(&self, path: &str) -> Result<Vec<PatternRecord>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, file, kind, name, line, confidence, created_at \
                 FROM patterns WHERE file = ?1 ORDER BY line",
            )?;
            let items = stmt
                .query_map(params![path], |row| {
                    Ok(PatternRecord {
                        id: row.get(0)?,
                        file: row.get(1)?,
                        kind: row.get(2)?,
                        name: row.get(3)?,
                        line: row.get(4)?,
                        confidence: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }

    pub fn callers_of(&self, callee: &str) -> Result<Vec<CallEdgeRecord>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, file, caller, callee, line, kind, created_at \
                 FROM call_edges WHERE callee = ?1 ORDER BY id",
            )?;
            let items = stmt
                .query_map(params![callee], |row| {
                    Ok(CallEdgeRecord {
                        id: row.get(0)?,
                        file: row.get(1)?,
                        caller: row.get(2)?,
                        callee: row.get(3)?,
                        line: row.get(4)?,
                        kind: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }

    pub fn count(&self, table: Table) -> Result<i64> {
        self.with_reader(|conn| {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name()), [], |row| {
                    row.get(0)
                })?;
            Ok(count)
        })
    }

    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, dest_path, reason, checksum, size_bytes, created_at, verified \
                 FROM backup_history ORDER BY id DESC",
            )?;
            let items = stmt
                .query_map([], |row| {
                    Ok(BackupRecord {
                        id: row.get(0)?,
                        dest_path: row.get(1)?,
                        reason: row.get(2)?,
                        checksum: row.get(3)?,
                        size_bytes: row.get(4)?,
                        created_at: row.get(5)?,
                        verified: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }

    pub fn latest_scan(&self) -> Result<Option<ScanRecord>> {
        self.with_reader(|conn| {
            let record = conn
                .query_row(
                    "SELECT id, root_path, started_at, completed_at, files_scanned, \
                            files_changed, files_removed, status \
                     FROM scan_history ORDER BY id DESC LIMIT 1",
                    [],
                    |row| {
                        Ok(ScanRecord {
                            id: row.get(0)?,
                            root_path: row.get(1)?,
                            started_at: row.get(2)?,
                            completed_at: row.get(3)?,
                            files_scanned: row.get(4)?,
                            files_changed: row.get(5)?,
                            files_removed: row.get(6)?,
                            status: row.get(7)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }
}

/// Row tables exposed through `Database::count`. Closed enum keeps table
/// names out of caller-supplied SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Files,
    Patterns,
    CallEdges,
    Violations,
    ScanHistory,
    BackupHistory,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Files => "file_metadata",
            Table::Patterns => "patterns",
            Table::CallEdges => "call_edges",
            Table::Violations => "violations",
            Table::ScanHistory => "scan_history",
            Table::BackupHistory => "backup_history",
        }
    }
}

/// Stamp columns as stored, for change detection against the filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredStamp {
    pub file_size: i64,
    pub mtime_secs: i64,
    pub mtime_nanos: i64,
    pub content_hash: Vec<u8>,
}

fn next_cursor_i64<T>(items: &[T], limit: i64, id: impl Fn(&T) -> i64) -> Option<i64> {
    if items.len() as i64 == limit {
        items.last().map(id)
    } else {
        None
    }
}
