use config::{Config, ConfigError, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Store-wide tuning knobs. Every field has a serde default so a partial
/// config file (or none at all) yields a working store.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub db_path: String,

    /// Directory for backup images and their manifests. Defaults to a
    /// `backups/` directory next to the database file.
    #[serde(default)]
    pub backup_dir: Option<String>,

    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Buffered batches that trigger an automatic flush.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Bound of the writer request channel; producers block when it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// WAL size that forces an emergency truncate checkpoint.
    #[serde(default = "default_wal_size_limit")]
    pub wal_size_limit_bytes: u64,

    /// Free-page fraction above which compaction runs VACUUM.
    #[serde(default = "default_vacuum_free_ratio")]
    pub vacuum_free_ratio: f64,

    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    #[serde(default)]
    pub retention: RetentionPolicy,
}

/// Age limits for derived rows, in days. Facts are recomputable, so the
/// defaults favour keeping the store small over keeping history forever.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "default_violation_days")]
    pub violation_days: i64,

    #[serde(default = "default_history_days")]
    pub history_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            violation_days: default_violation_days(),
            history_days: default_history_days(),
        }
    }
}

fn default_read_pool_size() -> usize {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_flush_threshold() -> usize {
    32
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_wal_size_limit() -> u64 {
    100 * 1024 * 1024
}

fn default_vacuum_free_ratio() -> f64 {
    0.2
}

fn default_violation_days() -> i64 {
    30
}

fn default_history_days() -> i64 {
    90
}

impl StoreConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            backup_dir: None,
            read_pool_size: default_read_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            flush_threshold: default_flush_threshold(),
            queue_capacity: default_queue_capacity(),
            wal_size_limit_bytes: default_wal_size_limit(),
            vacuum_free_ratio: default_vacuum_free_ratio(),
            ignore_patterns: Vec::new(),
            retention: RetentionPolicy::default(),
        }
    }

    /// Resolved backup directory: the configured one, or `backups/` beside
    /// the database file.
    pub fn backup_dir(&self) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(&self.db_path)
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("backups"),
        }
    }

    /// Sentinel lock file guarding the write epoch, beside the database.
    pub fn lock_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.db_path);
        path.set_extension("lock");
        path
    }
}

pub fn load_configuration() -> Result<StoreConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Factbase").required(false))
        .build()?;
    builder.try_deserialize::<StoreConfig>()
}
