pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod lock;
pub mod logging;
pub mod maintenance;
pub mod materialized;
pub mod retention;
pub mod scanner;
pub mod storage;
pub mod writer;

pub use backup::BackupReason;
pub use config::{RetentionPolicy, StoreConfig};
pub use engine::{ScanSummary, Store, WriteEpoch};
pub use error::{Error, Result};
pub use retention::RetentionReport;
pub use writer::{BatchTicket, FlushStats, TelemetrySnapshot, WriteBatch};
