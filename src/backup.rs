use crate::error::{Error, Result};
use crate::storage::models::BackupRecord;
use crate::storage::{queries, Database};
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Pages copied per backup step. Small steps with a pause keep the writer
/// responsive while a backup runs.
const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 64;
const BACKUP_STEP_PAUSE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupReason {
    Upgrade,
    Migration,
    UserRequest,
    Scheduled,
    PreDestructive,
}

impl BackupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupReason::Upgrade => "upgrade",
            BackupReason::Migration => "migration",
            BackupReason::UserRequest => "user_request",
            BackupReason::Scheduled => "scheduled",
            BackupReason::PreDestructive => "pre_destructive",
        }
    }
}

/// Companion file written next to every backup image. The manifest, not
/// the image name, is the authority when choosing a restore source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub reason: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub created_at: String,
    pub verified: bool,
}

/// Copies the live store through the SQLite backup API (never a raw file
/// copy, which would tear pages under a concurrent writer), verifies the
/// image, checksums it, and writes the manifest.
pub fn write_backup_image(
    src: &Connection,
    dir: &Path,
    reason: BackupReason,
) -> Result<(PathBuf, BackupManifest)> {
    fs::create_dir_all(dir)?;
    let created_at = chrono::Utc::now();
    let dest = dir.join(format!(
        "factbase-{}-{}.db",
        created_at.format("%Y%m%d%H%M%S%3f"),
        reason.as_str()
    ));

    {
        let mut dst = Connection::open(&dest)?;
        let backup = Backup::new(src, &mut dst)?;
        backup.run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_STEP_PAUSE, None)?;
    }

    let verified = image_is_sound(&dest)?;
    if !verified {
        warn!("Backup image {} failed its integrity check", dest.display());
    }

    let manifest = BackupManifest {
        reason: reason.as_str().to_string(),
        checksum: file_checksum(&dest)?,
        size_bytes: fs::metadata(&dest)?.len() as i64,
        created_at: created_at.to_rfc3339(),
        verified,
    };
    fs::write(manifest_path(&dest), serde_json::to_string_pretty(&manifest)?)?;

    info!(
        "Backup written to {} ({} bytes, reason {})",
        dest.display(),
        manifest.size_bytes,
        manifest.reason
    );
    Ok((dest, manifest))
}

/// Backs up an open store and records the result in `backup_history`.
pub fn create_backup(db: &Database, dir: &Path, reason: BackupReason) -> Result<BackupRecord> {
    let (dest, manifest) = db.with_writer(|conn| write_backup_image(conn, dir, reason))?;

    let mut record = BackupRecord {
        id: 0,
        dest_path: dest.to_string_lossy().into_owned(),
        reason: manifest.reason.clone(),
        checksum: manifest.checksum.clone(),
        size_bytes: manifest.size_bytes,
        created_at: manifest.created_at.clone(),
        verified: manifest.verified,
    };
    record.id = db.with_writer(|conn| queries::insert_backup_record(conn, &record))?;
    Ok(record)
}

/// Newest backup image in `dir` whose manifest says verified and whose
/// checksum still matches the bytes on disk.
pub fn latest_verified(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut best: Option<(String, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(image) = image_for_manifest(&path) else {
            continue;
        };
        let manifest: BackupManifest = match fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
        {
            Some(m) => m,
            None => continue,
        };
        if !manifest.verified || !image.exists() {
            continue;
        }
        if file_checksum(&image)? != manifest.checksum {
            warn!("Backup {} no longer matches its manifest checksum", image.display());
            continue;
        }
        match &best {
            Some((created_at, _)) if *created_at >= manifest.created_at => {}
            _ => best = Some((manifest.created_at.clone(), image)),
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Replaces the store at `db_path` with the backup image. The current
/// (possibly corrupt) database is kept beside it as `.corrupt-<ts>`, and
/// the swap is a same-directory rename so it is atomic on POSIX.
///
/// Callers must have closed every connection to `db_path` first.
pub fn restore_file(db_path: &Path, backup_path: &Path) -> Result<()> {
    if !image_is_sound(backup_path)? {
        return Err(Error::Corrupt(format!(
            "backup image {} failed its integrity check",
            backup_path.display()
        )));
    }
    if let Some(manifest) = read_manifest(backup_path) {
        if file_checksum(backup_path)? != manifest.checksum {
            return Err(Error::Corrupt(format!(
                "backup image {} does not match its manifest checksum",
                backup_path.display()
            )));
        }
    }

    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
    if db_path.exists() {
        let quarantine = db_path.with_extension(format!("corrupt-{}", ts));
        fs::copy(db_path, &quarantine)?;
        info!("Kept previous store at {}", quarantine.display());
    }
    // Stale WAL or shm files would be replayed against the restored image.
    for suffix in ["-wal", "-shm"] {
        let side = sidecar(db_path, suffix);
        if side.exists() {
            fs::remove_file(&side)?;
        }
    }

    let staging = db_path.with_extension(format!("restore-{}", ts));
    fs::copy(backup_path, &staging)?;
    fs::rename(&staging, db_path)?;

    info!(
        "Restored {} from {}",
        db_path.display(),
        backup_path.display()
    );
    Ok(())
}

fn image_is_sound(path: &Path) -> Result<bool> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    Ok(verdict == "ok")
}

fn file_checksum(path: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 65536];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn manifest_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(".manifest.json");
    PathBuf::from(name)
}

fn image_for_manifest(manifest: &Path) -> Option<PathBuf> {
    let name = manifest.file_name()?.to_str()?;
    let image = name.strip_suffix(".manifest.json")?;
    Some(manifest.with_file_name(image))
}

fn read_manifest(image: &Path) -> Option<BackupManifest> {
    let contents = fs::read_to_string(manifest_path(image)).ok()?;
    serde_json::from_str(&contents).ok()
}

fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
