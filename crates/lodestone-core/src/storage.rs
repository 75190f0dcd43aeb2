//! On-disk layout for dump databases, uploads, and conversion scratch files.
//!
//! Everything lives under one storage root:
//!
//! ```text
//! {root}/dumps/     completed dump databases
//! {root}/uploads/   raw uploads awaiting conversion
//! {root}/tmp/       conversion scratch, renamed into dumps/ on success
//! ```
//!
//! A dump database only appears under `dumps/` via an atomic rename, so a
//! file there is always complete. Scratch and upload files left behind by a
//! crash are swept at startup once they pass an age threshold.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};
use uuid::Uuid;

/// Resolves paths under the storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the storage directories if they do not exist.
    pub fn bootstrap(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.dumps_dir())?;
        std::fs::create_dir_all(self.uploads_dir())?;
        std::fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dumps_dir(&self) -> PathBuf {
        self.root.join("dumps")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Path of the cross-repository index database.
    pub fn xrepo_db_path(&self) -> PathBuf {
        self.root.join("xrepo.db")
    }

    /// Path of the job queue database.
    pub fn jobs_db_path(&self) -> PathBuf {
        self.root.join("jobs.db")
    }

    /// Final path of a completed dump database. The repository name is
    /// encoded so it cannot introduce extra path components.
    pub fn dump_path(&self, dump_id: i64, repository: &str, commit: &str) -> PathBuf {
        self.dumps_dir()
            .join(format!("{dump_id}-{}@{commit}.db", encode_segment(repository)))
    }

    /// A fresh scratch path for a conversion in progress.
    pub fn fresh_tmp_path(&self) -> PathBuf {
        self.tmp_dir().join(format!("{}.db", Uuid::new_v4()))
    }

    /// A fresh path for an incoming upload.
    pub fn fresh_upload_path(&self) -> PathBuf {
        self.uploads_dir().join(format!("{}.gz", Uuid::new_v4()))
    }

    /// Remove scratch and upload files older than `max_age`. Files younger
    /// than the threshold may belong to an in-flight conversion and are
    /// left alone. Returns the number of files removed.
    pub fn sweep_stale_files(&self, max_age: Duration) -> std::io::Result<usize> {
        let mut removed = 0;
        for dir in [self.tmp_dir(), self.uploads_dir()] {
            removed += sweep_dir(&dir, max_age)?;
        }
        Ok(removed)
    }
}

fn sweep_dir(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }

        let age = entry
            .metadata()?
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok());
        match age {
            Some(age) if age >= max_age => {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = %path.display(), "removed stale file");
                        removed += 1;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to remove stale file");
                    }
                }
            }
            _ => {}
        }
    }
    Ok(removed)
}

/// Replace characters that would split a filename into path components.
fn encode_segment(s: &str) -> String {
    s.replace(['/', '\\'], "_").replace("..", "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bootstrap_creates_directories() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().join("store"));
        layout.bootstrap().unwrap();

        assert!(layout.dumps_dir().is_dir());
        assert!(layout.uploads_dir().is_dir());
        assert!(layout.tmp_dir().is_dir());
    }

    #[test]
    fn test_dump_path_encodes_repository() {
        let layout = StorageLayout::new("/store");
        let path = layout.dump_path(7, "github.com/acme/widget", "deadbeef");
        assert_eq!(
            path,
            PathBuf::from("/store/dumps/7-github.com_acme_widget@deadbeef.db")
        );
    }

    #[test]
    fn test_sweep_removes_only_aged_files() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.bootstrap().unwrap();

        let stale = layout.tmp_dir().join("stale.db");
        std::fs::write(&stale, b"x").unwrap();
        let fresh = layout.uploads_dir().join("fresh.gz");
        std::fs::write(&fresh, b"x").unwrap();

        // Zero threshold sweeps everything; then confirm a large threshold
        // would have spared them.
        let removed = layout.sweep_stale_files(Duration::ZERO).unwrap();
        assert_eq!(removed, 2);
        assert!(!stale.exists());
        assert!(!fresh.exists());

        std::fs::write(&fresh, b"x").unwrap();
        let removed = layout.sweep_stale_files(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 0);
        assert!(fresh.exists());
    }
}
