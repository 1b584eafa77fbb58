//! On-disk fixtures for tests.
//!
//! Store directories, manifests, and id journals in tests all live under
//! one fixture directory per test, named `/tmp/emberdb_tests/<pid>_<seq>`.
//! The pid keeps parallel test binaries apart and the sequence counter keeps
//! parallel tests within one binary apart. The directory is removed on drop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FIXTURE: AtomicU64 = AtomicU64::new(0);

pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let seq = NEXT_FIXTURE.fetch_add(1, Ordering::SeqCst);
        let path = PathBuf::from("/tmp/emberdb_tests")
            .join(format!("{}_{}", std::process::id(), seq));

        // A crashed earlier run with the same pid may have left state here.
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;

        Ok(Self { path })
    }

    /// The fixture directory itself, handed to stores as their root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a journal or table file inside the fixture directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
