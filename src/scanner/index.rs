use super::walk::DiskStamp;
use crate::hasher;
use crate::storage::StoredStamp;
use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, error};

/// A file whose content hash differs from the stored one (or was never
/// stored). Carries everything needed to write a fresh stamp.
#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub path: String,
    pub file_size: i64,
    pub mtime_secs: i64,
    pub mtime_nanos: i64,
    pub content_hash: u64,
}

/// Outcome of diffing the filesystem against stored stamps.
///
/// `changed` needs re-analysis. `refreshed` was touched (new mtime) but has
/// identical content, so only its stamp needs rewriting. `removed` paths
/// are known to the store but gone from disk.
#[derive(Debug, Default)]
pub struct ScanDelta {
    pub changed: Vec<ChangedFile>,
    pub refreshed: Vec<ChangedFile>,
    pub removed: Vec<String>,
    pub unchanged: usize,
}

/// Two-level change detection.
///
/// Level 1 compares size and mtime (seconds and nanos): an exact match
/// means unchanged and the file is never read. Everything else gets its
/// content hashed in parallel, and only a hash mismatch marks it changed.
pub fn diff(
    known: &HashMap<String, StoredStamp>,
    on_disk: &DashMap<String, DiskStamp>,
) -> ScanDelta {
    let mut delta = ScanDelta::default();
    let mut candidates: Vec<(String, DiskStamp)> = Vec::new();

    for entry in on_disk.iter() {
        let path = entry.key();
        let disk = *entry.value();
        match known.get(path) {
            Some(stored)
                if stored.file_size == disk.file_size
                    && stored.mtime_secs == disk.mtime_secs
                    && stored.mtime_nanos == disk.mtime_nanos =>
            {
                delta.unchanged += 1;
            }
            _ => candidates.push((path.clone(), disk)),
        }
    }

    for path in known.keys() {
        if !on_disk.contains_key(path) {
            delta.removed.push(path.clone());
        }
    }

    // Level 2: hash only the stamp mismatches. Per-file read errors are
    // logged and the file skipped; it will be retried on the next scan.
    let hashed: Vec<ChangedFile> = candidates
        .par_iter()
        .filter_map(|(path, disk)| match hasher::hash_file(Path::new(path)) {
            Ok(content_hash) => Some(ChangedFile {
                path: path.clone(),
                file_size: disk.file_size,
                mtime_secs: disk.mtime_secs,
                mtime_nanos: disk.mtime_nanos,
                content_hash,
            }),
            Err(e) => {
                error!("Error hashing file '{}': {}", path, e);
                None
            }
        })
        .collect();

    for file in hashed {
        let stored_hash = known
            .get(&file.path)
            .and_then(|s| hasher::blob_to_hash(&s.content_hash));
        if stored_hash == Some(file.content_hash) {
            delta.refreshed.push(file);
        } else {
            delta.changed.push(file);
        }
    }

    debug!(
        "Change detection: {} changed, {} refreshed, {} removed, {} unchanged",
        delta.changed.len(),
        delta.refreshed.len(),
        delta.removed.len(),
        delta.unchanged,
    );
    delta
}

/// Best-effort language tag from the file extension; analyzers may
/// overwrite it with something smarter.
pub fn language_for(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("rs") => "rust",
        Some("py") => "python",
        Some("ts") | Some("tsx") => "typescript",
        Some("js") | Some("jsx") => "javascript",
        Some("go") => "go",
        Some("java") => "java",
        Some("c") | Some("h") => "c",
        Some("cc") | Some("cpp") | Some("hpp") => "cpp",
        _ => "",
    }
}
