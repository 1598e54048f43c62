//! Cache directory structure
//!
//! Every store's on-disk state lives under one cache root:
//!
//! ```text
//! cache/
//! ├── {store_id}                   # single-file stores (current generation)
//! ├── {store_id}.1                 # previous generation (safe-save)
//! ├── {store_id}.0                 # transient pending write, never trusted
//! ├── {store_id}_20260807_101500   # append-only rotated files
//! └── LostFound/
//!     └── {store_id}[.stamp].corrupt
//! ```
//!
//! Store ids are sanitized for filesystem use before any path is formed.

use chrono::{DateTime, Utc};
use mirror_core::StoreId;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Name of the quarantine directory for corrupt generations.
pub const LOST_FOUND_DIR: &str = "LostFound";

/// Cache directory paths for one cache root.
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Create paths rooted at a cache directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        CachePaths {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The quarantine directory for corrupt generations.
    pub fn lost_found_dir(&self) -> PathBuf {
        self.root.join(LOST_FOUND_DIR)
    }

    /// Current-generation cache file for a single-file store.
    pub fn store_file(&self, store_id: &StoreId) -> PathBuf {
        self.root.join(store_id.sanitized())
    }

    /// The transient pending generation (`<path>.0`).
    ///
    /// Present only mid-save; its existence at load time is evidence of a
    /// crash during a save and the file must never be read.
    pub fn pending_file(path: &Path) -> PathBuf {
        Self::with_suffix(path, ".0")
    }

    /// The retained previous generation (`<path>.1`).
    pub fn backup_file(path: &Path) -> PathBuf {
        Self::with_suffix(path, ".1")
    }

    /// Quarantine destination for a corrupt generation.
    ///
    /// With `verbose` a timestamp is embedded so every incident is retained;
    /// otherwise one rolling file per store is kept.
    pub fn quarantine_file(&self, store_id: &StoreId, verbose: bool, when: DateTime<Utc>) -> PathBuf {
        let name = if verbose {
            format!(
                "{}.{}.corrupt",
                store_id.sanitized(),
                when.format("%Y%m%d_%H%M%S")
            )
        } else {
            format!("{}.corrupt", store_id.sanitized())
        };
        self.lost_found_dir().join(name)
    }

    /// Path for a new append-only rotated file.
    pub fn rotated_file(&self, store_id: &StoreId, when: DateTime<Utc>) -> PathBuf {
        self.root.join(format!(
            "{}_{}",
            store_id.sanitized(),
            when.format("%Y%m%d_%H%M%S")
        ))
    }

    /// All rotated files for a store, ordered by creation time.
    ///
    /// Matches `{store_id}*` excluding safe-save generations and quarantine.
    /// Falls back to name order where the filesystem has no creation time;
    /// the timestamped naming makes both orders agree.
    pub fn list_rotated_files(&self, store_id: &StoreId) -> io::Result<Vec<PathBuf>> {
        let prefix = store_id.sanitized();
        let mut files: Vec<(PathBuf, Option<SystemTime>)> = Vec::new();

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(prefix.as_str()) {
                continue;
            }
            if name.ends_with(".0") || name.ends_with(".1") || name.ends_with(".corrupt") {
                continue;
            }
            let created = entry.metadata().and_then(|m| m.created()).ok();
            files.push((entry.path(), created));
        }

        files.sort_by(|(pa, ca), (pb, cb)| match (ca, cb) {
            (Some(a), Some(b)) => a.cmp(b).then_with(|| pa.cmp(pb)),
            _ => pa.cmp(pb),
        });

        Ok(files.into_iter().map(|(p, _)| p).collect())
    }

    /// Create the cache root and quarantine directories.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.lost_found_dir())?;
        Ok(())
    }

    fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_id() -> StoreId {
        StoreId::from_raw("abc123")
    }

    #[test]
    fn test_store_file_and_generations() {
        let paths = CachePaths::new("/tmp/cache");
        let file = paths.store_file(&store_id());

        assert_eq!(file, PathBuf::from("/tmp/cache/abc123"));
        assert_eq!(
            CachePaths::pending_file(&file),
            PathBuf::from("/tmp/cache/abc123.0")
        );
        assert_eq!(
            CachePaths::backup_file(&file),
            PathBuf::from("/tmp/cache/abc123.1")
        );
    }

    #[test]
    fn test_store_file_sanitizes_id() {
        let paths = CachePaths::new("/tmp/cache");
        let file = paths.store_file(&StoreId::from_raw("a/b:c"));
        assert_eq!(file, PathBuf::from("/tmp/cache/a_b_c"));
    }

    #[test]
    fn test_quarantine_naming() {
        let paths = CachePaths::new("/tmp/cache");
        let when = DateTime::parse_from_rfc3339("2026-08-07T10:15:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let rolling = paths.quarantine_file(&store_id(), false, when);
        assert_eq!(rolling, PathBuf::from("/tmp/cache/LostFound/abc123.corrupt"));

        let verbose = paths.quarantine_file(&store_id(), true, when);
        assert_eq!(
            verbose,
            PathBuf::from("/tmp/cache/LostFound/abc123.20260807_101500.corrupt")
        );
    }

    #[test]
    fn test_rotated_file_naming() {
        let paths = CachePaths::new("/tmp/cache");
        let when = DateTime::parse_from_rfc3339("2026-08-07T10:15:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(
            paths.rotated_file(&store_id(), when),
            PathBuf::from("/tmp/cache/abc123_20260807_101500")
        );
    }

    #[test]
    fn test_list_rotated_files_skips_generations() {
        let dir = tempdir().unwrap();
        let paths = CachePaths::new(dir.path());
        paths.ensure_dirs().unwrap();

        let id = store_id();
        std::fs::write(dir.path().join("abc123_20260101_000000"), b"[]").unwrap();
        std::fs::write(dir.path().join("abc123_20260102_000000"), b"[]").unwrap();
        std::fs::write(dir.path().join("abc123.0"), b"junk").unwrap();
        std::fs::write(dir.path().join("abc123.1"), b"[]").unwrap();
        std::fs::write(dir.path().join("unrelated"), b"[]").unwrap();

        let files = paths.list_rotated_files(&id).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].to_string_lossy().ends_with("20260101_000000"));
        assert!(files[1].to_string_lossy().ends_with("20260102_000000"));
    }

    #[test]
    fn test_list_rotated_files_missing_root() {
        let paths = CachePaths::new("/nonexistent/cache/root");
        assert!(paths.list_rotated_files(&store_id()).unwrap().is_empty());
    }
}
