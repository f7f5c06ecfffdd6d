use serde::{Deserialize, Serialize};

/// Stamp and counters for one analyzed file. `content_hash` is the 8-byte
/// little-endian XxHash64 of the file contents and is the sole authority
/// for deciding whether a file needs re-analysis.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub language: String,
    pub file_size: i64,
    pub mtime_secs: i64,
    pub mtime_nanos: i64,
    pub content_hash: Vec<u8>,
    pub last_scanned_at: i64,
    pub scan_duration_us: i64,
    pub pattern_count: i64,
    pub edge_count: i64,
    pub violation_count: i64,
}

/// A detected convention pattern, anchored to a file and line.
#[derive(Debug, Clone)]
pub struct PatternRecord {
    pub id: i64,
    pub file: String,
    pub kind: String,
    pub name: String,
    pub line: i64,
    pub confidence: f64,
    pub created_at: i64,
}

/// One resolved caller-to-callee edge of the call graph.
#[derive(Debug, Clone)]
pub struct CallEdgeRecord {
    pub id: i64,
    pub file: String,
    pub caller: String,
    pub callee: String,
    pub line: i64,
    pub kind: String,
    pub created_at: i64,
}

/// A rule violation. Ids are caller-assigned stable strings so re-analysis
/// of a file replaces rather than duplicates its findings.
#[derive(Debug, Clone)]
pub struct ViolationRecord {
    pub id: String,
    pub file: String,
    pub line: i64,
    pub severity: String,
    pub rule: String,
    pub message: String,
    pub suppressed: bool,
    pub created_at: i64,
}

/// One completed scan pass over a set of roots.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub id: i64,
    pub root_path: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub files_scanned: i64,
    pub files_changed: i64,
    pub files_removed: i64,
    pub status: String,
}

/// Ledger row for a backup image, mirrored by its on-disk manifest.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub id: i64,
    pub dest_path: String,
    pub reason: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub created_at: String,
    pub verified: bool,
}

/// Store-wide health summary, materialized once per write epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub files: i64,
    pub patterns: i64,
    pub call_edges: i64,
    pub violations: i64,
    pub suppressed: i64,
    pub health_score: f64,
}

/// Violation counts per severity, materialized alongside the status row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeveritySnapshot {
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
}

/// One page of a keyset-paginated listing. `next_cursor` is `None` on the
/// last page; pass it back to resume where the page ended.
#[derive(Debug, Clone)]
pub struct Page<T, C> {
    pub items: Vec<T>,
    pub next_cursor: Option<C>,
}
