//! Pre-migration backups of the source snapshot.
//!
//! The source is copied byte for byte into the backup directory under
//! `<stem>_pre_migration_<YYYYmmdd_HHMMSS>[_<n>].<ext>`. The copy is hashed
//! while streaming, synced, re-read and compared, then made read-only. A JSON
//! manifest next to the backup records where it came from and its digest.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::MigrationError;

/// Operation tag in backup names.
const OPERATION: &str = "pre_migration";

/// Suffix of the manifest sidecar.
const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Copy buffer size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Highest same-second disambiguation suffix tried.
const MAX_SUFFIX: u32 = 1000;

/// Metadata stored next to a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Path the backup was copied from.
    pub source: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
    /// When the copy was made.
    pub created_at: DateTime<Utc>,
}

/// A completed backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    /// Backup file.
    pub path: PathBuf,
    /// Manifest sidecar.
    pub manifest_path: PathBuf,
    /// Recorded metadata.
    pub manifest: BackupManifest,
}

impl BackupArtifact {
    /// Load an artifact from its backup path and manifest sidecar.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, MigrationError> {
        let path = path.into();
        let manifest_path = manifest_path_for(&path);
        let text = fs::read_to_string(&manifest_path).map_err(|e| MigrationError::BackupWrite {
            path: manifest_path.clone(),
            reason: format!("cannot read manifest: {e}"),
        })?;
        let manifest = serde_json::from_str(&text).map_err(|e| MigrationError::BackupWrite {
            path: manifest_path.clone(),
            reason: format!("invalid manifest: {e}"),
        })?;
        Ok(Self {
            path,
            manifest_path,
            manifest,
        })
    }
}

/// Creates and checks backups in one directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    /// Create a manager for a backup directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `source` into the backup directory.
    pub fn backup(&self, source: &Path) -> Result<BackupArtifact, MigrationError> {
        self.backup_at(source, Utc::now())
    }

    /// Copy `source`, naming the backup after `now`.
    pub fn backup_at(
        &self,
        source: &Path,
        now: DateTime<Utc>,
    ) -> Result<BackupArtifact, MigrationError> {
        let unavailable = |reason: String| MigrationError::SourceUnavailable {
            path: source.to_path_buf(),
            reason,
        };
        let metadata = fs::metadata(source).map_err(|e| unavailable(e.to_string()))?;
        if !metadata.is_file() {
            return Err(unavailable("not a regular file".to_string()));
        }
        let reader = File::open(source).map_err(|e| unavailable(e.to_string()))?;

        fs::create_dir_all(&self.dir).map_err(|e| self.write_error(&self.dir, e))?;
        let (path, mut out) = self.create_unique(source, now)?;

        let copied = copy_hashing(BufReader::new(reader), &mut out)
            .and_then(|hashed| out.sync_all().map(|()| hashed));
        let (size, sha256) = match copied {
            Ok(hashed) => hashed,
            Err(e) => {
                drop(out);
                discard(&path);
                return Err(self.write_error(&path, e));
            }
        };
        drop(out);

        self.confirm_copy(&path, size, &sha256, metadata.len())?;
        if let Err(e) = set_readonly(&path) {
            discard(&path);
            return Err(self.write_error(&path, e));
        }

        let manifest = BackupManifest {
            source: source.to_path_buf(),
            size,
            sha256,
            created_at: now,
        };
        let manifest_path = manifest_path_for(&path);
        let json = serde_json::to_vec_pretty(&manifest).map_err(|e| MigrationError::BackupWrite {
            path: manifest_path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&manifest_path, json).map_err(|e| self.write_error(&manifest_path, e))?;

        info!(
            backup = %path.display(),
            size,
            sha256 = %manifest.sha256,
            "source backed up"
        );
        Ok(BackupArtifact {
            path,
            manifest_path,
            manifest,
        })
    }

    /// Recompute a backup's digest and compare it with its manifest.
    pub fn verify(&self, artifact: &BackupArtifact) -> Result<(), MigrationError> {
        let (size, sha256) = File::open(&artifact.path)
            .and_then(|f| copy_hashing(BufReader::new(f), &mut io::sink()))
            .map_err(|e| MigrationError::BackupWrite {
                path: artifact.path.clone(),
                reason: format!("cannot read backup: {e}"),
            })?;
        if size != artifact.manifest.size || sha256 != artifact.manifest.sha256 {
            return Err(MigrationError::BackupWrite {
                path: artifact.path.clone(),
                reason: format!(
                    "digest mismatch: manifest has {} bytes {}, file has {} bytes {}",
                    artifact.manifest.size, artifact.manifest.sha256, size, sha256
                ),
            });
        }
        Ok(())
    }

    /// Copy a backup out to `dest`, which must not exist.
    pub fn restore(&self, artifact: &BackupArtifact, dest: &Path) -> Result<u64, MigrationError> {
        self.verify(artifact)?;
        let size = self.copy_checked(&artifact.path, dest, &artifact.manifest.sha256)?;
        info!(backup = %artifact.path.display(), dest = %dest.display(), size, "backup restored");
        Ok(size)
    }

    /// Re-read a fresh copy and remove it unless it matches what was written
    /// and the source length.
    fn confirm_copy(
        &self,
        path: &Path,
        size: u64,
        sha256: &str,
        source_len: u64,
    ) -> Result<(), MigrationError> {
        let reread = match File::open(path)
            .and_then(|f| copy_hashing(BufReader::new(f), &mut io::sink()))
        {
            Ok(reread) => reread,
            Err(e) => {
                discard(path);
                return Err(self.write_error(path, e));
            }
        };
        if reread.0 != size || reread.1 != sha256 || size != source_len {
            discard(path);
            return Err(MigrationError::BackupWrite {
                path: path.to_path_buf(),
                reason: format!(
                    "copy does not match source: {} bytes {} read back as {} bytes {}",
                    size, sha256, reread.0, reread.1
                ),
            });
        }
        Ok(())
    }

    /// Copy `input` to a new file at `dest`, removing it again unless the
    /// copy hashes to `expected`.
    fn copy_checked(
        &self,
        input: &Path,
        dest: &Path,
        expected: &str,
    ) -> Result<u64, MigrationError> {
        let reader = File::open(input).map_err(|e| self.write_error(input, e))?;
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .map_err(|e| self.write_error(dest, e))?;
        let copied = copy_hashing(BufReader::new(reader), &mut out)
            .and_then(|hashed| out.sync_all().map(|()| hashed));
        drop(out);

        match copied {
            Ok((size, sha256)) if sha256 == expected => Ok(size),
            Ok(_) => {
                discard(dest);
                Err(MigrationError::BackupWrite {
                    path: dest.to_path_buf(),
                    reason: "restored copy does not match the manifest".to_string(),
                })
            }
            Err(e) => {
                discard(dest);
                Err(self.write_error(dest, e))
            }
        }
    }

    fn create_unique(
        &self,
        source: &Path,
        now: DateTime<Utc>,
    ) -> Result<(PathBuf, File), MigrationError> {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        let ext = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let stamp = now.format("%Y%m%d_%H%M%S");

        for n in 0..=MAX_SUFFIX {
            let name = if n == 0 {
                format!("{stem}_{OPERATION}_{stamp}{ext}")
            } else {
                format!("{stem}_{OPERATION}_{stamp}_{n}{ext}")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(self.write_error(&path, e)),
            }
        }

        Err(MigrationError::BackupWrite {
            path: self.dir.clone(),
            reason: format!("no free backup name for {stem} at {stamp}"),
        })
    }

    fn write_error(&self, path: &Path, err: io::Error) -> MigrationError {
        MigrationError::BackupWrite {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

/// Manifest sidecar path for a backup.
pub fn manifest_path_for(backup: &Path) -> PathBuf {
    let mut name = backup.as_os_str().to_owned();
    name.push(MANIFEST_SUFFIX);
    PathBuf::from(name)
}

/// SHA-256 of a file as lowercase hex.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    copy_hashing(BufReader::new(file), &mut io::sink()).map(|(_, digest)| digest)
}

fn copy_hashing(mut input: impl Read, output: &mut impl Write) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
    output.flush()?;
    Ok((total, hex::encode(hasher.finalize())))
}

fn set_readonly(path: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove partial copy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 5).unwrap()
    }

    fn source(dir: &Path) -> PathBuf {
        let path = dir.join("books.db");
        fs::write(&path, b"SQLite format 3\0 pretend pages").unwrap();
        path
    }

    #[test]
    fn test_backup_name_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"));

        let artifact = manager.backup_at(&src, fixed_time()).unwrap();
        assert_eq!(
            artifact.path.file_name().unwrap(),
            "books_pre_migration_20240517_093005.db"
        );
        assert_eq!(fs::read(&artifact.path).unwrap(), fs::read(&src).unwrap());
        assert_eq!(artifact.manifest.sha256, sha256_file(&src).unwrap());
        assert!(fs::metadata(&artifact.path).unwrap().permissions().readonly());

        let loaded = BackupArtifact::load(&artifact.path).unwrap();
        assert_eq!(loaded, artifact);
        manager.verify(&loaded).unwrap();
    }

    #[test]
    fn test_same_second_backups_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"));

        let first = manager.backup_at(&src, fixed_time()).unwrap();
        let second = manager.backup_at(&src, fixed_time()).unwrap();
        assert_ne!(first.path, second.path);
        assert_eq!(
            second.path.file_name().unwrap(),
            "books_pre_migration_20240517_093005_1.db"
        );
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("backups"));
        let err = manager.backup(&dir.path().join("absent.db")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SourceUnavailable);
        assert!(!dir.path().join("backups").exists());
    }

    #[test]
    fn test_unwritable_destination_is_backup_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path());
        // A regular file where the backup directory should be.
        let blocker = dir.path().join("backups");
        fs::write(&blocker, b"x").unwrap();

        let err = BackupManager::new(&blocker).backup(&src).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BackupWriteError);
    }

    #[test]
    fn test_restore_round_trip_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"));
        let artifact = manager.backup(&src).unwrap();

        let dest = dir.path().join("restored.db");
        manager.restore(&artifact, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), fs::read(&src).unwrap());

        let err = manager.restore(&artifact, &dest).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BackupWriteError);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"));
        let mut artifact = manager.backup(&src).unwrap();

        artifact.manifest.sha256 = "00".repeat(32);
        assert_eq!(
            manager.verify(&artifact).unwrap_err().kind(),
            crate::ErrorKind::BackupWriteError
        );
    }

    #[test]
    fn test_mismatched_restore_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"));

        let dest = dir.path().join("restored.db");
        let err = manager
            .copy_checked(&src, &dest, &"00".repeat(32))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BackupWriteError);
        assert!(!dest.exists());
    }

    #[test]
    fn test_unconfirmed_copy_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path());
        let copy = dir.path().join("copy.db");
        fs::copy(&src, &copy).unwrap();
        let manager = BackupManager::new(dir.path().join("backups"));

        let (size, sha256) = copy_hashing(File::open(&src).unwrap(), &mut io::sink()).unwrap();
        manager.confirm_copy(&copy, size, &sha256, size).unwrap();
        assert!(copy.exists());

        let err = manager
            .confirm_copy(&copy, size, &sha256, size + 1)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BackupWriteError);
        assert!(!copy.exists());

        let err = manager.confirm_copy(&copy, size, &sha256, size).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BackupWriteError);
    }
}
