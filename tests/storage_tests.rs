use factbase::error::Error;
use factbase::storage::models::*;
use factbase::storage::queries;
use factbase::storage::{Database, Table};
use tempfile::TempDir;

fn make_file(path: &str) -> FileRecord {
    FileRecord {
        path: path.to_string(),
        language: "rust".to_string(),
        file_size: 1024,
        mtime_secs: 1_700_000_000,
        mtime_nanos: 0,
        content_hash: factbase::hasher::hash_to_blob(factbase::hasher::hash_data(path.as_bytes())),
        last_scanned_at: 1_700_000_000,
        scan_duration_us: 150,
        pattern_count: 0,
        edge_count: 0,
        violation_count: 0,
    }
}

fn make_pattern(file: &str, name: &str, line: i64) -> PatternRecord {
    PatternRecord {
        id: 0,
        file: file.to_string(),
        kind: "naming".to_string(),
        name: name.to_string(),
        line,
        confidence: 0.9,
        created_at: 1_700_000_000,
    }
}

fn make_violation(id: &str, file: &str, severity: &str) -> ViolationRecord {
    ViolationRecord {
        id: id.to_string(),
        file: file.to_string(),
        line: 10,
        severity: severity.to_string(),
        rule: "no-unwrap".to_string(),
        message: "unwrap in library code".to_string(),
        suppressed: false,
        created_at: 1_700_000_000,
    }
}

fn seed_files(db: &Database, paths: &[&str]) {
    let files: Vec<FileRecord> = paths.iter().map(|p| make_file(p)).collect();
    db.with_writer(|conn| queries::insert_files(conn, &files))
        .unwrap();
}

#[test]
fn test_pragmas_applied() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("facts.db"), 2, 5000).unwrap();

    let (journal, fk): (String, i64) = db
        .with_writer(|conn| {
            let journal: String =
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
            Ok((journal, fk))
        })
        .unwrap();
    assert_eq!(journal.to_lowercase(), "wal");
    assert_eq!(fk, 1);
}

#[test]
fn test_reopen_is_noop_migration() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("facts.db");

    {
        let db = Database::open(&path, 1, 5000).unwrap();
        seed_files(&db, &["/src/a.rs"]);
        db.close().unwrap();
    }
    // Second open finds the schema current and the data intact.
    let db = Database::open(&path, 1, 5000).unwrap();
    assert_eq!(db.count(Table::Files).unwrap(), 1);
}

#[test]
fn test_file_upsert_replaces_stamp() {
    let db = Database::open_in_memory().unwrap();
    seed_files(&db, &["/src/a.rs"]);

    let mut updated = make_file("/src/a.rs");
    updated.file_size = 2048;
    updated.mtime_secs = 1_700_000_999;
    db.with_writer(|conn| queries::insert_files(conn, &[updated]))
        .unwrap();

    assert_eq!(db.count(Table::Files).unwrap(), 1);
    let record = db.get_file("/src/a.rs").unwrap().unwrap();
    assert_eq!(record.file_size, 2048);
    assert_eq!(record.mtime_secs, 1_700_000_999);
}

#[test]
fn test_remove_files_cascades_derived_rows() {
    let db = Database::open_in_memory().unwrap();
    seed_files(&db, &["/src/a.rs", "/src/b.rs"]);
    db.with_writer(|conn| {
        queries::insert_patterns(
            conn,
            &[make_pattern("/src/a.rs", "snake_case", 1), make_pattern("/src/b.rs", "camelCase", 2)],
        )?;
        queries::insert_violations(conn, &[make_violation("v1", "/src/a.rs", "high")])
    })
    .unwrap();

    let removed = db
        .with_writer(|conn| queries::remove_files(conn, &["/src/a.rs".to_string()]))
        .unwrap();
    assert_eq!(removed, 1);

    assert_eq!(db.count(Table::Files).unwrap(), 1);
    assert_eq!(db.count(Table::Patterns).unwrap(), 1);
    assert_eq!(db.count(Table::Violations).unwrap(), 0);
    assert!(db.patterns_for_file("/src/a.rs").unwrap().is_empty());
}

#[test]
fn test_violation_id_is_stable() {
    let db = Database::open_in_memory().unwrap();
    seed_files(&db, &["/src/a.rs"]);

    db.with_writer(|conn| {
        queries::insert_violations(conn, &[make_violation("v1", "/src/a.rs", "high")])
    })
    .unwrap();
    // Re-analysis writes the same id again; the row is replaced, not duplicated.
    let mut replacement = make_violation("v1", "/src/a.rs", "medium");
    replacement.message = "updated finding".to_string();
    db.with_writer(|conn| queries::insert_violations(conn, &[replacement]))
        .unwrap();

    assert_eq!(db.count(Table::Violations).unwrap(), 1);
    let page = db.list_violations(None, 10).unwrap();
    assert_eq!(page.items[0].severity, "medium");
}

#[test]
fn test_cursor_pagination_walks_all_patterns() {
    let db = Database::open_in_memory().unwrap();
    seed_files(&db, &["/src/a.rs"]);
    let patterns: Vec<PatternRecord> = (0..25)
        .map(|i| make_pattern("/src/a.rs", &format!("p{}", i), i))
        .collect();
    db.with_writer(|conn| queries::insert_patterns(conn, &patterns))
        .unwrap();

    let mut seen = 0;
    let mut cursor = None;
    let mut pages = 0;
    loop {
        let page = db.list_patterns(cursor, 10).unwrap();
        seen += page.items.len();
        pages += 1;
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, 25);
    assert_eq!(pages, 3);
}

#[test]
fn test_callers_of_crosses_files() {
    let db = Database::open_in_memory().unwrap();
    seed_files(&db, &["/src/a.rs", "/src/b.rs"]);
    let edges = vec![
        CallEdgeRecord {
            id: 0,
            file: "/src/a.rs".to_string(),
            caller: "main".to_string(),
            callee: "parse".to_string(),
            line: 5,
            kind: "direct".to_string(),
            created_at: 1_700_000_000,
        },
        CallEdgeRecord {
            id: 0,
            file: "/src/b.rs".to_string(),
            caller: "run".to_string(),
            callee: "parse".to_string(),
            line: 9,
            kind: "direct".to_string(),
            created_at: 1_700_000_000,
        },
    ];
    db.with_writer(|conn| queries::insert_call_edges(conn, &edges))
        .unwrap();

    let callers = db.callers_of("parse").unwrap();
    assert_eq!(callers.len(), 2);
    assert_eq!(db.callers_of("emit").unwrap().len(), 0);
}

#[test]
fn test_read_pool_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("facts.db"), 2, 5000).unwrap();

    let result = db.with_reader(|conn| {
        conn.execute("INSERT INTO scan_history (root_path, started_at) VALUES ('x', 0)", [])?;
        Ok(())
    });
    assert!(matches!(result, Err(Error::ReadOnly)));
}

#[test]
fn test_load_stamps_round_trip() {
    let db = Database::open_in_memory().unwrap();
    seed_files(&db, &["/src/a.rs", "/src/b.rs"]);

    let stamps = db.load_stamps().unwrap();
    assert_eq!(stamps.len(), 2);
    let stamp = &stamps["/src/a.rs"];
    assert_eq!(stamp.file_size, 1024);
    assert_eq!(stamp.mtime_secs, 1_700_000_000);
    assert_eq!(stamp.content_hash.len(), 8);
}

#[test]
fn test_integrity_report_clean_store() {
    let db = Database::open_in_memory().unwrap();
    seed_files(&db, &["/src/a.rs"]);
    let report = db.integrity_report().unwrap();
    assert!(report.ok);
    assert!(report.errors.is_empty());
    assert_eq!(report.foreign_key_violations, 0);
}

#[test]
fn test_uncommitted_transaction_rolls_back_on_disconnect() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("facts.db");

    {
        let db = Database::open(&path, 1, 5000).unwrap();
        seed_files(&db, &["/src/committed.rs"]);
        db.close().unwrap();
    }

    // An interrupted writer: transaction begun, rows staged, connection
    // dropped without COMMIT.
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        conn.execute(
            "INSERT INTO file_metadata \
             (path, language, file_size, mtime_secs, mtime_nanos, content_hash, last_scanned_at) \
             VALUES ('/src/staged.rs', '', 1, 1, 1, x'0000000000000000', 1)",
            [],
        )
        .unwrap();
        drop(conn);
    }

    // Recovery leaves exactly the pre-transaction state.
    let db = Database::open(&path, 1, 5000).unwrap();
    assert_eq!(db.count(Table::Files).unwrap(), 1);
    assert!(db.get_file("/src/staged.rs").unwrap().is_none());
}

#[test]
fn test_full_database_surfaces_disk_full() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("facts.db"), 1, 5000).unwrap();

    let result = db.with_writer(|conn| {
        // Cap the file at a handful of pages to simulate a full disk.
        conn.pragma_update(None, "max_page_count", 8)?;
        let files: Vec<FileRecord> = (0..10_000)
            .map(|i| {
                let mut f = make_file(&format!("/src/f{}.rs", i));
                f.language = "x".repeat(512);
                f
            })
            .collect();
        queries::insert_files(conn, &files)?;
        Ok(())
    });

    match result {
        Err(Error::DiskFull) | Err(Error::Rejected { .. }) => {}
        other => panic!("expected DiskFull, got {:?}", other),
    }
}

#[test]
fn test_latest_scan_returns_newest() {
    let db = Database::open_in_memory().unwrap();
    let scans = vec![
        ScanRecord {
            id: 0,
            root_path: "/repo".to_string(),
            started_at: 100,
            completed_at: Some(110),
            files_scanned: 10,
            files_changed: 10,
            files_removed: 0,
            status: "completed".to_string(),
        },
        ScanRecord {
            id: 0,
            root_path: "/repo".to_string(),
            started_at: 200,
            completed_at: Some(205),
            files_scanned: 10,
            files_changed: 1,
            files_removed: 2,
            status: "completed".to_string(),
        },
    ];
    db.with_writer(|conn| queries::insert_scans(conn, &scans))
        .unwrap();

    let latest = db.latest_scan().unwrap().unwrap();
    assert_eq!(latest.started_at, 200);
    assert_eq!(latest.files_removed, 2);
}
