use factbase::error::Error;
use factbase::storage::models::*;
use factbase::storage::Table;
use factbase::writer::WriteBatch;
use factbase::{Store, StoreConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn config_in(dir: &Path) -> StoreConfig {
    factbase::logging::init_logger();
    StoreConfig::new(dir.join("facts.db").to_string_lossy().into_owned())
}

fn make_file(path: &str) -> FileRecord {
    FileRecord {
        path: path.to_string(),
        language: "rust".to_string(),
        file_size: 64,
        mtime_secs: 1_700_000_000,
        mtime_nanos: 0,
        content_hash: vec![1; 8],
        last_scanned_at: 1_700_000_000,
        scan_duration_us: 0,
        pattern_count: 0,
        edge_count: 0,
        violation_count: 0,
    }
}

fn make_violation(id: &str, file: &str, severity: &str, created_at: i64) -> ViolationRecord {
    ViolationRecord {
        id: id.to_string(),
        file: file.to_string(),
        line: 1,
        severity: severity.to_string(),
        rule: "rule".to_string(),
        message: "finding".to_string(),
        suppressed: false,
        created_at,
    }
}

#[test]
fn test_epoch_is_exclusive_within_process() {
    let store = Store::open_in_memory().unwrap();

    let epoch = store.begin_epoch().unwrap();
    match store.begin_epoch() {
        Err(Error::ConcurrentWriter { .. }) => {}
        other => panic!("expected ConcurrentWriter, got {:?}", other.map(|_| ())),
    }

    epoch.finish().unwrap();
    // Released: a new epoch may begin.
    let epoch = store.begin_epoch().unwrap();
    epoch.finish().unwrap();
}

#[test]
fn test_lock_file_excludes_second_store_handle() {
    let dir = TempDir::new().unwrap();
    let config = config_in(dir.path());
    let store_a = Store::open(config.clone()).unwrap();
    let store_b = Store::open(config).unwrap();

    let epoch_a = store_a.begin_epoch().unwrap();
    match store_b.begin_epoch() {
        Err(Error::ConcurrentWriter { holder_pid }) => {
            assert_eq!(holder_pid, std::process::id());
        }
        other => panic!("expected ConcurrentWriter, got {:?}", other.map(|_| ())),
    }

    epoch_a.finish().unwrap();
    let epoch_b = store_b.begin_epoch().unwrap();
    epoch_b.finish().unwrap();
}

#[test]
fn test_epoch_writes_and_snapshot_consistency() {
    let store = Store::open_in_memory().unwrap();
    let epoch = store.begin_epoch().unwrap();

    let files = epoch
        .submit(WriteBatch::Files(vec![
            make_file("/src/a.rs"),
            make_file("/src/b.rs"),
        ]))
        .unwrap();
    let violations = epoch
        .submit(WriteBatch::Violations(vec![
            make_violation("v1", "/src/a.rs", "critical", 1_700_000_000),
            make_violation("v2", "/src/b.rs", "low", 1_700_000_000),
        ]))
        .unwrap();
    epoch.flush().unwrap();
    files.wait().unwrap();
    violations.wait().unwrap();
    epoch.finish().unwrap();

    // Snapshots materialized in the epoch's final commit agree with the
    // base tables.
    let status = store.db().status_snapshot().unwrap().unwrap();
    assert_eq!(status.files, store.db().count(Table::Files).unwrap());
    assert_eq!(status.violations, store.db().count(Table::Violations).unwrap());
    assert!(status.health_score < 100.0);

    let severity = store.db().severity_snapshot().unwrap().unwrap();
    assert_eq!(severity.critical, 1);
    assert_eq!(severity.low, 1);

    // Per-file counters refreshed in the same commit.
    let file = store.db().get_file("/src/a.rs").unwrap().unwrap();
    assert_eq!(file.violation_count, 1);
}

#[test]
fn test_scan_roots_detects_and_persists_delta() {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    fs::create_dir_all(&repo).unwrap();
    fs::write(repo.join("a.rs"), "fn a() {}").unwrap();
    fs::write(repo.join("b.rs"), "fn b() {}").unwrap();

    let store = Store::open(config_in(dir.path())).unwrap();
    let root = repo.to_string_lossy().into_owned();

    let epoch = store.begin_epoch().unwrap();
    let summary = store.scan_roots(&epoch, &[&root]).unwrap();
    epoch.finish().unwrap();
    assert_eq!(summary.files_changed, 2);
    assert_eq!(store.db().count(Table::Files).unwrap(), 2);

    // Nothing moved: second scan is all fast-path skips.
    let epoch = store.begin_epoch().unwrap();
    let summary = store.scan_roots(&epoch, &[&root]).unwrap();
    epoch.finish().unwrap();
    assert_eq!(summary.files_changed, 0);
    assert_eq!(summary.files_unchanged, 2);

    // Delete one file: the next scan removes its facts.
    fs::remove_file(repo.join("b.rs")).unwrap();
    let epoch = store.begin_epoch().unwrap();
    let summary = store.scan_roots(&epoch, &[&root]).unwrap();
    epoch.finish().unwrap();
    assert_eq!(summary.files_removed, 1);
    assert_eq!(store.db().count(Table::Files).unwrap(), 1);

    let scan = store.db().latest_scan().unwrap().unwrap();
    assert_eq!(scan.status, "completed");
    assert_eq!(scan.files_removed, 1);
    store.close().unwrap();
}

#[test]
fn test_retention_prunes_old_rows_and_keeps_recent() {
    let store = Store::open_in_memory().unwrap();
    let now = chrono::Utc::now().timestamp();
    let ancient = now - 400 * 86_400;

    let epoch = store.begin_epoch().unwrap();
    epoch
        .submit(WriteBatch::Files(vec![make_file("/src/a.rs")]))
        .unwrap();
    epoch
        .submit(WriteBatch::Violations(vec![
            make_violation("old", "/src/a.rs", "high", ancient),
            make_violation("new", "/src/a.rs", "high", now),
        ]))
        .unwrap();
    epoch.finish().unwrap();

    let report = store.apply_retention().unwrap();
    assert_eq!(report.violations_deleted, 1);

    let page = store.db().list_violations(None, 10).unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, "new");
}

#[test]
fn test_retention_refreshes_snapshots_in_same_pass() {
    let store = Store::open_in_memory().unwrap();
    let ancient = chrono::Utc::now().timestamp() - 400 * 86_400;

    let epoch = store.begin_epoch().unwrap();
    epoch
        .submit(WriteBatch::Files(vec![make_file("/src/a.rs")]))
        .unwrap();
    epoch
        .submit(WriteBatch::Violations(vec![make_violation(
            "old", "/src/a.rs", "critical", ancient,
        )]))
        .unwrap();
    epoch.finish().unwrap();

    let status = store.db().status_snapshot().unwrap().unwrap();
    assert_eq!(status.violations, 1);

    let report = store.apply_retention().unwrap();
    assert_eq!(report.violations_deleted, 1);

    // Snapshots and counters were recomputed in the retention transaction,
    // not deferred to the next epoch.
    let status = store.db().status_snapshot().unwrap().unwrap();
    assert_eq!(status.violations, store.db().count(Table::Violations).unwrap());
    assert_eq!(status.violations, 0);
    assert!((status.health_score - 100.0).abs() < f64::EPSILON);

    let severity = store.db().severity_snapshot().unwrap().unwrap();
    assert_eq!(severity.critical, 0);

    let file = store.db().get_file("/src/a.rs").unwrap().unwrap();
    assert_eq!(file.violation_count, 0);
}

#[test]
fn test_telemetry_accumulates_across_epochs() {
    let store = Store::open_in_memory().unwrap();

    for i in 0..2 {
        let epoch = store.begin_epoch().unwrap();
        epoch
            .submit(WriteBatch::Files(vec![make_file(&format!("/src/{}.rs", i))]))
            .unwrap();
        epoch.finish().unwrap();
    }

    let telemetry = store.telemetry();
    assert_eq!(telemetry.rows_files, 2);
    assert!(telemetry.flushes >= 2);
    assert_eq!(telemetry.batches_failed, 0);
}

#[test]
fn test_validate_compact_and_checkpoint() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(config_in(dir.path())).unwrap();

    let epoch = store.begin_epoch().unwrap();
    let files: Vec<FileRecord> = (0..100)
        .map(|i| make_file(&format!("/src/f{}.rs", i)))
        .collect();
    epoch.submit(WriteBatch::Files(files)).unwrap();
    epoch.finish().unwrap();

    assert!(store.validate().unwrap().ok);

    // Fresh store has nothing to reclaim; the call itself must be safe.
    store.compact().unwrap();

    let report = store.db().checkpoint_passive().unwrap();
    assert!(!report.busy);
    store.close().unwrap();
}

#[test]
fn test_epoch_drop_without_finish_releases_the_store() {
    let store = Store::open_in_memory().unwrap();
    {
        let epoch = store.begin_epoch().unwrap();
        epoch
            .submit(WriteBatch::Files(vec![make_file("/src/a.rs")]))
            .unwrap();
        // Dropped without finish: the buffered batch still lands and the
        // epoch slot is released.
    }
    assert_eq!(store.db().count(Table::Files).unwrap(), 1);
    let epoch = store.begin_epoch().unwrap();
    epoch.finish().unwrap();
}
