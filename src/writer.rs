use crate::error::{Error, Result};
use crate::materialized;
use crate::storage::models::{
    CallEdgeRecord, FileRecord, PatternRecord, ScanRecord, ViolationRecord,
};
use crate::storage::{queries, Database};
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// One unit of atomicity on the write path: a batch commits whole or is
/// rejected whole. Each variant carries one record domain.
#[derive(Debug, Clone)]
pub enum WriteBatch {
    Files(Vec<FileRecord>),
    Patterns(Vec<PatternRecord>),
    CallEdges(Vec<CallEdgeRecord>),
    Violations(Vec<ViolationRecord>),
    RemoveFiles(Vec<String>),
    ScanHistory(Vec<ScanRecord>),
}

impl WriteBatch {
    pub fn domain(&self) -> &'static str {
        match self {
            WriteBatch::Files(_) => "file_metadata",
            WriteBatch::Patterns(_) => "patterns",
            WriteBatch::CallEdges(_) => "call_edges",
            WriteBatch::Violations(_) => "violations",
            WriteBatch::RemoveFiles(_) => "remove_files",
            WriteBatch::ScanHistory(_) => "scan_history",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WriteBatch::Files(rows) => rows.len(),
            WriteBatch::Patterns(rows) => rows.len(),
            WriteBatch::CallEdges(rows) => rows.len(),
            WriteBatch::Violations(rows) => rows.len(),
            WriteBatch::RemoveFiles(rows) => rows.len(),
            WriteBatch::ScanHistory(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receipt for one submitted batch. The result arrives when the batch's
/// flush commits; a rejected batch resolves to `Rejected` naming the
/// offending row while its siblings in the same flush still persist.
pub struct BatchTicket {
    rx: Receiver<Result<usize>>,
}

impl BatchTicket {
    pub fn wait(self) -> Result<usize> {
        self.rx.recv().map_err(|_| Error::WriterClosed)?
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushStats {
    pub batches_applied: usize,
    pub batches_failed: usize,
    pub rows_written: usize,
}

/// Cumulative write-path counters, shared across epochs.
#[derive(Debug, Default)]
pub struct Telemetry {
    pub rows_files: AtomicU64,
    pub rows_patterns: AtomicU64,
    pub rows_call_edges: AtomicU64,
    pub rows_violations: AtomicU64,
    pub rows_scans: AtomicU64,
    pub rows_removed: AtomicU64,
    pub batches_applied: AtomicU64,
    pub batches_failed: AtomicU64,
    pub flushes: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub rows_files: u64,
    pub rows_patterns: u64,
    pub rows_call_edges: u64,
    pub rows_violations: u64,
    pub rows_scans: u64,
    pub rows_removed: u64,
    pub batches_applied: u64,
    pub batches_failed: u64,
    pub flushes: u64,
}

impl Telemetry {
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            rows_files: self.rows_files.load(Ordering::Relaxed),
            rows_patterns: self.rows_patterns.load(Ordering::Relaxed),
            rows_call_edges: self.rows_call_edges.load(Ordering::Relaxed),
            rows_violations: self.rows_violations.load(Ordering::Relaxed),
            rows_scans: self.rows_scans.load(Ordering::Relaxed),
            rows_removed: self.rows_removed.load(Ordering::Relaxed),
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }

    fn record_rows(&self, domain: &str, rows: u64) {
        match domain {
            "file_metadata" => self.rows_files.fetch_add(rows, Ordering::Relaxed),
            "patterns" => self.rows_patterns.fetch_add(rows, Ordering::Relaxed),
            "call_edges" => self.rows_call_edges.fetch_add(rows, Ordering::Relaxed),
            "violations" => self.rows_violations.fetch_add(rows, Ordering::Relaxed),
            "scan_history" => self.rows_scans.fetch_add(rows, Ordering::Relaxed),
            "remove_files" => self.rows_removed.fetch_add(rows, Ordering::Relaxed),
            _ => 0,
        };
    }
}

enum Request {
    Submit {
        batch: WriteBatch,
        reply: Sender<Result<usize>>,
    },
    Flush {
        refresh: bool,
        reply: Sender<Result<FlushStats>>,
    },
    Shutdown {
        reply: Sender<Result<FlushStats>>,
    },
}

/// The single writer: a bounded channel feeding one dedicated thread that
/// buffers batches and applies them in group commits. Producers block when
/// the channel is full, which is the backpressure mechanism.
pub struct BatchWriter {
    request_tx: SyncSender<Request>,
    thread_handle: Option<JoinHandle<()>>,
    telemetry: Arc<Telemetry>,
}

impl BatchWriter {
    pub fn spawn(
        db: Arc<Database>,
        flush_threshold: usize,
        queue_capacity: usize,
        wal_limit_bytes: u64,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::sync_channel(queue_capacity);
        let thread_telemetry = Arc::clone(&telemetry);

        let thread_handle = thread::Builder::new()
            .name("factbase-writer".to_string())
            .spawn(move || {
                run_writer(db, request_rx, flush_threshold, wal_limit_bytes, thread_telemetry);
            })
            .map_err(Error::Io)?;

        Ok(BatchWriter {
            request_tx,
            thread_handle: Some(thread_handle),
            telemetry,
        })
    }

    /// Queues a batch for the next flush. Blocks if the channel is full.
    pub fn submit(&self, batch: WriteBatch) -> Result<BatchTicket> {
        let (reply, rx) = mpsc::channel();
        self.request_tx
            .send(Request::Submit { batch, reply })
            .map_err(|_| Error::WriterClosed)?;
        Ok(BatchTicket { rx })
    }

    /// Applies everything buffered in one group commit and waits for it.
    /// Snapshot refresh is reserved for the epoch-ending flush that
    /// `shutdown` performs.
    pub fn flush(&self) -> Result<FlushStats> {
        let (reply, rx) = mpsc::channel();
        self.request_tx
            .send(Request::Flush {
                refresh: false,
                reply,
            })
            .map_err(|_| Error::WriterClosed)?;
        rx.recv().map_err(|_| Error::WriterClosed)?
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Flushes leftovers (with snapshot refresh) and joins the thread.
    pub fn shutdown(mut self) -> Result<FlushStats> {
        let (reply, rx) = mpsc::channel();
        self.request_tx
            .send(Request::Shutdown { reply })
            .map_err(|_| Error::WriterClosed)?;
        let stats = rx.recv().map_err(|_| Error::WriterClosed)?;
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Writer thread panicked during shutdown");
            }
        }
        stats
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let (reply, _rx) = mpsc::channel();
            let _ = self.request_tx.send(Request::Shutdown { reply });
            let _ = handle.join();
        }
    }
}

fn run_writer(
    db: Arc<Database>,
    request_rx: Receiver<Request>,
    flush_threshold: usize,
    wal_limit_bytes: u64,
    telemetry: Arc<Telemetry>,
) {
    let mut buffered: Vec<(WriteBatch, Sender<Result<usize>>)> = Vec::new();

    while let Ok(request) = request_rx.recv() {
        match request {
            Request::Submit { batch, reply } => {
                buffered.push((batch, reply));
                if buffered.len() >= flush_threshold {
                    // Threshold flush: results go to the tickets, nobody
                    // waits on the flush itself. The WAL ceiling applies
                    // here too, since a producer may never flush explicitly.
                    if let Err(e) = flush_buffered(&db, &mut buffered, false, &telemetry) {
                        error!("Threshold flush failed: {}", e);
                    } else if let Err(e) = db.enforce_wal_limit(wal_limit_bytes) {
                        error!("WAL ceiling check after threshold flush failed: {}", e);
                    }
                }
            }
            Request::Flush { refresh, reply } => {
                let result = flush_buffered(&db, &mut buffered, refresh, &telemetry);
                let _ = reply.send(result);
            }
            Request::Shutdown { reply } => {
                let result = flush_buffered(&db, &mut buffered, true, &telemetry);
                let _ = reply.send(result);
                break;
            }
        }
    }
    debug!("Writer thread exiting");
}

/// Group commit: everything buffered goes into one BEGIN IMMEDIATE
/// transaction, each batch inside its own savepoint. A failing batch rolls
/// back alone; the others commit. Tickets are resolved only after COMMIT,
/// so a resolved Ok means durable.
fn flush_buffered(
    db: &Arc<Database>,
    buffered: &mut Vec<(WriteBatch, Sender<Result<usize>>)>,
    refresh: bool,
    telemetry: &Telemetry,
) -> Result<FlushStats> {
    if buffered.is_empty() && !refresh {
        return Ok(FlushStats::default());
    }

    let (batch_list, senders): (Vec<WriteBatch>, Vec<Sender<Result<usize>>>) =
        buffered.drain(..).unzip();
    let batch_count = batch_list.len();

    let outcome = db.with_writer(|conn| {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match apply_all(conn, &batch_list, refresh) {
            Ok(applied) => {
                conn.execute_batch("COMMIT")?;
                Ok(applied)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    });

    match outcome {
        Ok(Applied {
            stats,
            results,
            domain_rows,
        }) => {
            for (sender, result) in senders.into_iter().zip(results) {
                let _ = sender.send(result);
            }
            for (domain, rows) in domain_rows {
                telemetry.record_rows(domain, rows);
            }
            telemetry
                .batches_applied
                .fetch_add(stats.batches_applied as u64, Ordering::Relaxed);
            telemetry
                .batches_failed
                .fetch_add(stats.batches_failed as u64, Ordering::Relaxed);
            telemetry.flushes.fetch_add(1, Ordering::Relaxed);
            info!(
                "Flushed {} batches ({} rows, {} rejected)",
                batch_count, stats.rows_written, stats.batches_failed
            );
            Ok(stats)
        }
        Err(e) => {
            // The transaction never committed: every ticket of this flush
            // learns about the failure.
            error!("Flush of {} batches failed: {}", batch_count, e);
            for sender in senders {
                let _ = sender.send(Err(shallow_copy(&e)));
            }
            Err(e)
        }
    }
}

/// Errors are not Clone; reproduce the taxonomy for fan-out to tickets.
fn shallow_copy(e: &Error) -> Error {
    match e {
        Error::Busy => Error::Busy,
        Error::DiskFull => Error::DiskFull,
        Error::Corrupt(detail) => Error::Corrupt(detail.clone()),
        Error::ReadOnly => Error::ReadOnly,
        other => Error::Other(format!("flush failed: {}", other)),
    }
}

struct Applied {
    stats: FlushStats,
    results: Vec<Result<usize>>,
    domain_rows: Vec<(&'static str, u64)>,
}

fn apply_all(conn: &Connection, batches: &[WriteBatch], refresh: bool) -> Result<Applied> {
    let mut stats = FlushStats::default();
    let mut results = Vec::with_capacity(batches.len());
    let mut domain_rows: Vec<(&'static str, u64)> = Vec::new();

    for (i, batch) in batches.iter().enumerate() {
        let savepoint = format!("batch_{}", i);
        conn.execute_batch(&format!("SAVEPOINT {}", savepoint))?;
        match apply_batch(conn, batch) {
            Ok(rows) => {
                conn.execute_batch(&format!("RELEASE {}", savepoint))?;
                stats.batches_applied += 1;
                stats.rows_written += rows;
                domain_rows.push((batch.domain(), rows as u64));
                results.push(Ok(rows));
            }
            Err(e) => {
                conn.execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", savepoint))?;
                debug!("Batch {} ({}) rejected: {}", i, batch.domain(), e);
                stats.batches_failed += 1;
                results.push(Err(e));
            }
        }
    }

    if refresh {
        materialized::refresh_all(conn)?;
    }

    Ok(Applied {
        stats,
        results,
        domain_rows,
    })
}

fn apply_batch(conn: &Connection, batch: &WriteBatch) -> Result<usize> {
    match batch {
        WriteBatch::Files(rows) => queries::insert_files(conn, rows),
        WriteBatch::Patterns(rows) => queries::insert_patterns(conn, rows),
        WriteBatch::CallEdges(rows) => queries::insert_call_edges(conn, rows),
        WriteBatch::Violations(rows) => queries::insert_violations(conn, rows),
        WriteBatch::RemoveFiles(paths) => queries::remove_files(conn, paths),
        WriteBatch::ScanHistory(rows) => queries::insert_scans(conn, rows),
    }
}
