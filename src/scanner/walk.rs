use dashmap::DashMap;
use glob::Pattern;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::error;

/// Size and mtime of a file as found on disk. The cheap half of change
/// detection; content hashes settle anything this cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskStamp {
    pub file_size: i64,
    pub mtime_secs: i64,
    pub mtime_nanos: i64,
}

/// Parallel directory traversal. Builds a map of path to DiskStamp,
/// filtering by glob ignore patterns. Skips symlinks.
pub fn walk_roots(
    root_paths: &[&str],
    ignore_globs: &[&str],
) -> io::Result<DashMap<String, DiskStamp>> {
    let map: DashMap<String, DiskStamp> = DashMap::new();

    let ignore_patterns: Vec<Pattern> = ignore_globs
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect();

    root_paths
        .par_iter()
        .try_for_each(|root_dir| visit_dirs(Path::new(root_dir), &map, &ignore_patterns))?;

    Ok(map)
}

fn visit_dirs(
    dir: &Path,
    map: &DashMap<String, DiskStamp>,
    ignore_patterns: &[Pattern],
) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    if ignore_patterns
        .iter()
        .any(|pattern| pattern.matches_path(dir))
    {
        return Ok(());
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() == io::ErrorKind::PermissionDenied {
                error!("Access denied reading directory {}: {}", dir.display(), err);
                return Ok(());
            } else {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error reading directory {}: {}", dir.display(), err),
                ));
            }
        }
    };

    entries.par_bridge().try_for_each(|entry_result| {
        let entry = match entry_result {
            Ok(entry) => entry,
            Err(err) => {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error reading entry in directory {}: {}", dir.display(), err),
                ));
            }
        };

        let path = entry.path();
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error getting metadata for {}: {}", path.display(), err),
                ));
            }
        };

        if metadata.file_type().is_symlink() {
            return Ok(());
        }

        if path.is_dir() {
            visit_dirs(&path, map, ignore_patterns)?;
        } else if !ignore_patterns
            .iter()
            .any(|pattern| pattern.matches_path(&path))
        {
            let (mtime_secs, mtime_nanos) = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| (d.as_secs() as i64, d.subsec_nanos() as i64))
                .unwrap_or((0, 0));

            map.insert(
                path.to_string_lossy().into_owned(),
                DiskStamp {
                    file_size: metadata.len() as i64,
                    mtime_secs,
                    mtime_nanos,
                },
            );
        }
        Ok(())
    })?;

    Ok(())
}
