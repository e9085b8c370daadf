//! Host capabilities.
//!
//! The export pipeline and the orchestrator never touch the clock, id source or
//! filesystem directly; they go through these traits so tests can substitute
//! deterministic or failing implementations.

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of unique, URL-safe identifiers.
pub trait IdGenerator: Send + Sync {
    /// Produce a fresh identifier.
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Filesystem primitives used by the export pipeline and the orchestrator.
pub trait FileSystem: Send + Sync {
    /// Create a directory and all missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Remove a directory tree. Missing directories are not an error.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Remove a single file. Missing files are not an error.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Whether anything exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Size of the file at `path` in bytes.
    fn file_size(&self, path: &Path) -> Result<u64>;

    /// Write `contents` to `path` with the given unix mode, truncating any
    /// existing file.
    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()>;

    /// Root for temporary directories.
    fn temp_dir(&self) -> PathBuf;
}

/// Filesystem backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            options.mode(mode);
            let mut file = options.open(path)?;
            // umask may have narrowed the mode on creation, and an existing
            // file keeps its old permissions.
            file.set_permissions(std::fs::Permissions::from_mode(mode))?;
            file.write_all(contents)?;
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            let mut file = options.open(path)?;
            file.write_all(contents)?;
        }
        Ok(())
    }

    fn temp_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_ids_are_url_safe_and_distinct() {
        let ids = UuidGenerator;
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn test_remove_missing_paths_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem;
        fs.remove_file(&dir.path().join("nope")).unwrap();
        fs.remove_dir_all(&dir.path().join("nope")).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_write_file_truncates_and_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.ovf");
        let fs = OsFileSystem;

        fs.write_file(&path, b"a much longer first version", 0o600).unwrap();
        fs.write_file(&path, b"short", 0o644).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "short");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        assert_eq!(fs.file_size(&path).unwrap(), 5);
    }
}
