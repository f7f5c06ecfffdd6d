use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database busy: another connection holds the write lock; retry after the busy timeout")]
    Busy,

    #[error("disk full: free space, apply retention, or compact the store")]
    DiskFull,

    #[error("database corrupt: {0}; restore from the latest verified backup")]
    Corrupt(String),

    #[error("connection is read-only: writes must go through a write epoch")]
    ReadOnly,

    #[error("migration to schema version {version} failed: {detail}; store left at its prior version")]
    Migration { version: i64, detail: String },

    #[error("another writer (pid {holder_pid}) holds the epoch lock; wait for it or break a stale lock")]
    ConcurrentWriter { holder_pid: u32 },

    #[error("batch rejected: {domain} row {row}: {detail}")]
    Rejected {
        domain: &'static str,
        row: usize,
        detail: String,
    },

    #[error("batch writer has shut down")]
    WriterClosed,

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps SQLite failure codes onto the operational taxonomy so callers can
/// distinguish retryable conditions from fatal ones.
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Error::Busy,
                ErrorCode::DiskFull => Error::DiskFull,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => Error::Corrupt(
                    message
                        .clone()
                        .unwrap_or_else(|| "malformed database image".to_string()),
                ),
                ErrorCode::ReadOnly => Error::ReadOnly,
                _ => Error::Database(e),
            },
            _ => Error::Database(e),
        }
    }
}

impl Error {
    /// Transient errors that a caller may retry without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy)
    }
}
