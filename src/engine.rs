use crate::backup::{self, BackupReason};
use crate::config::{RetentionPolicy, StoreConfig};
use crate::error::{Error, Result};
use crate::lock::ProcessLock;
use crate::retention::{self, RetentionReport};
use crate::scanner;
use crate::storage::models::{BackupRecord, FileRecord, ScanRecord};
use crate::storage::{migrations, Database, IntegrityReport};
use crate::writer::{BatchTicket, BatchWriter, FlushStats, Telemetry, TelemetrySnapshot, WriteBatch};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Facade over the whole store: connections, migrations, the write epoch
/// protocol, backups, and maintenance.
pub struct Store {
    db: Arc<Database>,
    config: StoreConfig,
    telemetry: Arc<Telemetry>,
    epoch_active: Arc<AtomicBool>,
}

impl Store {
    /// Opens (creating or migrating as needed) the store described by
    /// `config`. A pending migration against a non-empty store triggers a
    /// backup first. A corrupt store is restored from the newest verified
    /// backup automatically; open fails only when no such backup exists.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let db_path = PathBuf::from(&config.db_path);
        pre_migration_backup(&config)?;

        let db = match Database::open(&db_path, config.read_pool_size, config.busy_timeout_ms) {
            Ok(db) => db,
            Err(Error::Corrupt(detail)) => {
                warn!("Store at {} is corrupt: {}", db_path.display(), detail);
                let image = backup::latest_verified(&config.backup_dir())?
                    .ok_or(Error::Corrupt(detail))?;
                backup::restore_file(&db_path, &image)?;
                let db =
                    Database::open(&db_path, config.read_pool_size, config.busy_timeout_ms)?;
                info!("Recovered store from {}", image.display());
                db
            }
            Err(e) => return Err(e),
        };

        Ok(Store {
            db: Arc::new(db),
            config,
            telemetry: Arc::new(Telemetry::default()),
            epoch_active: Arc::new(AtomicBool::new(false)),
        })
    }

    /// In-memory store for tests; no epoch lock file, single connection.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Store {
            db: Arc::new(Database::open_in_memory()?),
            config: StoreConfig::new(":memory:"),
            telemetry: Arc::new(Telemetry::default()),
            epoch_active: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Starts the write epoch: in-process exclusivity via a flag, cross-
    /// process exclusivity via the advisory lock file. All writes flow
    /// through the returned epoch's writer thread until `finish`.
    pub fn begin_epoch(&self) -> Result<WriteEpoch> {
        if self
            .epoch_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ConcurrentWriter {
                holder_pid: std::process::id(),
            });
        }

        let lock = if self.db.path().is_some() {
            match ProcessLock::acquire(&self.config.lock_path()) {
                Ok(lock) => Some(lock),
                Err(e) => {
                    self.epoch_active.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let writer = match BatchWriter::spawn(
            Arc::clone(&self.db),
            self.config.flush_threshold,
            self.config.queue_capacity,
            self.config.wal_size_limit_bytes,
            Arc::clone(&self.telemetry),
        ) {
            Ok(writer) => writer,
            Err(e) => {
                self.epoch_active.store(false, Ordering::Release);
                return Err(e);
            }
        };

        Ok(WriteEpoch {
            writer: Some(writer),
            _lock: lock,
            db: Arc::clone(&self.db),
            config: self.config.clone(),
            epoch_active: Arc::clone(&self.epoch_active),
        })
    }

    /// Walks `roots`, diffs against stored stamps, and writes the delta
    /// (fresh stamps, removals, a scan record) through the epoch. The
    /// returned summary lists the paths whose facts need recomputing.
    pub fn scan_roots(&self, epoch: &WriteEpoch, roots: &[&str]) -> Result<ScanSummary> {
        let start = Instant::now();
        let started_at = chrono::Utc::now().timestamp();

        let known = self.db.load_stamps()?;
        let ignore: Vec<&str> = self
            .config
            .ignore_patterns
            .iter()
            .map(|s| s.as_str())
            .collect();
        let on_disk = scanner::walk_roots(roots, &ignore)?;
        let delta = scanner::diff(&known, &on_disk);

        let now = chrono::Utc::now().timestamp();
        let stamps: Vec<FileRecord> = delta
            .changed
            .iter()
            .chain(delta.refreshed.iter())
            .map(|f| file_record(f, now))
            .collect();

        let mut tickets: Vec<BatchTicket> = Vec::new();
        if !stamps.is_empty() {
            tickets.push(epoch.submit(WriteBatch::Files(stamps))?);
        }
        if !delta.removed.is_empty() {
            tickets.push(epoch.submit(WriteBatch::RemoveFiles(delta.removed.clone()))?);
        }
        tickets.push(epoch.submit(WriteBatch::ScanHistory(vec![ScanRecord {
            id: 0,
            root_path: roots.join(","),
            started_at,
            completed_at: Some(now),
            files_scanned: on_disk.len() as i64,
            files_changed: delta.changed.len() as i64,
            files_removed: delta.removed.len() as i64,
            status: "completed".to_string(),
        }]))?);

        epoch.flush()?;
        for ticket in tickets {
            ticket.wait()?;
        }

        let summary = ScanSummary {
            changed: delta.changed.iter().map(|f| f.path.clone()).collect(),
            files_scanned: on_disk.len(),
            files_changed: delta.changed.len(),
            files_refreshed: delta.refreshed.len(),
            files_removed: delta.removed.len(),
            files_unchanged: delta.unchanged,
            duration: start.elapsed(),
        };
        info!(
            "Scan completed in {:.2}s: {} files, {} changed, {} removed, {} unchanged",
            summary.duration.as_secs_f64(),
            summary.files_scanned,
            summary.files_changed,
            summary.files_removed,
            summary.files_unchanged,
        );
        Ok(summary)
    }

    pub fn backup(&self, reason: BackupReason) -> Result<BackupRecord> {
        backup::create_backup(&self.db, &self.config.backup_dir(), reason)
    }

    /// Swaps the store for the given backup image and reopens. Fails if an
    /// epoch is running. The replaced database is kept beside the store.
    pub fn restore(self, backup_path: &Path) -> Result<Store> {
        if self.epoch_active.load(Ordering::Acquire) {
            return Err(Error::Other(
                "cannot restore while a write epoch is active".to_string(),
            ));
        }
        let config = self.config.clone();
        self.close()?;
        backup::restore_file(Path::new(&config.db_path), backup_path)?;
        Store::open(config)
    }

    pub fn validate(&self) -> Result<IntegrityReport> {
        self.db.integrity_report()
    }

    /// VACUUMs when fragmentation warrants it; returns whether it ran.
    pub fn compact(&self) -> Result<bool> {
        self.db.vacuum_if_fragmented(self.config.vacuum_free_ratio)
    }

    /// Retention with the configured policy, then a compaction check.
    pub fn apply_retention(&self) -> Result<RetentionReport> {
        let policy = self.config.retention.clone();
        self.apply_retention_with(&policy)
    }

    pub fn apply_retention_with(&self, policy: &RetentionPolicy) -> Result<RetentionReport> {
        let report = retention::apply(&self.db, policy)?;
        self.compact()?;
        Ok(report)
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Checkpoints and closes every connection. No-op when something else
    /// (a running epoch) still holds the database.
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.db) {
            Ok(db) => db.close(),
            Err(_) => {
                warn!("Store closed while other handles remain; skipping checkpoint");
                Ok(())
            }
        }
    }
}

/// Exclusive write window. Batches flow to the writer thread; `finish`
/// flushes the tail with a snapshot refresh, truncates the WAL, and
/// releases both locks. Dropping without `finish` still flushes and
/// releases, so a panicking producer cannot wedge the store.
pub struct WriteEpoch {
    writer: Option<BatchWriter>,
    _lock: Option<ProcessLock>,
    db: Arc<Database>,
    config: StoreConfig,
    epoch_active: Arc<AtomicBool>,
}

impl WriteEpoch {
    pub fn submit(&self, batch: WriteBatch) -> Result<BatchTicket> {
        match &self.writer {
            Some(writer) => writer.submit(batch),
            None => Err(Error::WriterClosed),
        }
    }

    /// Mid-epoch group commit. Also enforces the WAL size ceiling.
    pub fn flush(&self) -> Result<FlushStats> {
        let stats = match &self.writer {
            Some(writer) => writer.flush()?,
            None => return Err(Error::WriterClosed),
        };
        self.db.enforce_wal_limit(self.config.wal_size_limit_bytes)?;
        Ok(stats)
    }

    /// Ends the epoch: final flush (with snapshot refresh, in the same
    /// commit), WAL truncation, lock release.
    pub fn finish(mut self) -> Result<FlushStats> {
        let writer = self.writer.take().ok_or(Error::WriterClosed)?;
        let stats = writer.shutdown()?;
        self.db.checkpoint_truncate()?;
        Ok(stats)
    }
}

impl Drop for WriteEpoch {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.shutdown() {
                warn!("Writer shutdown during epoch drop failed: {}", e);
            }
        }
        self.epoch_active.store(false, Ordering::Release);
    }
}

/// What a scan pass found and wrote.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    /// Paths whose content changed; their facts need recomputing.
    pub changed: Vec<String>,
    pub files_scanned: usize,
    pub files_changed: usize,
    pub files_refreshed: usize,
    pub files_removed: usize,
    pub files_unchanged: usize,
    pub duration: Duration,
}

fn file_record(f: &scanner::ChangedFile, now: i64) -> FileRecord {
    FileRecord {
        path: f.path.clone(),
        language: scanner::language_for(&f.path).to_string(),
        file_size: f.file_size,
        mtime_secs: f.mtime_secs,
        mtime_nanos: f.mtime_nanos,
        content_hash: crate::hasher::hash_to_blob(f.content_hash),
        last_scanned_at: now,
        scan_duration_us: 0,
        pattern_count: 0,
        edge_count: 0,
        violation_count: 0,
    }
}

/// Backup ahead of a schema migration on a non-empty store. Skipped for
/// fresh files and for images too broken to read a version from; the
/// corrupt path through `Store::open` handles those.
fn pre_migration_backup(config: &StoreConfig) -> Result<()> {
    let path = Path::new(&config.db_path);
    if !path.exists() {
        return Ok(());
    }
    let conn = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => conn,
        Err(_) => return Ok(()),
    };
    let version: i64 = match conn.query_row("PRAGMA user_version", [], |row| row.get(0)) {
        Ok(version) => version,
        Err(_) => return Ok(()),
    };
    if version > 0 && version < migrations::latest_version() {
        info!(
            "Schema upgrade pending ({} -> {}); backing up first",
            version,
            migrations::latest_version()
        );
        backup::write_backup_image(&conn, &config.backup_dir(), BackupReason::Migration)?;
    }
    Ok(())
}
