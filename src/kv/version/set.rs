//! The per-store version set: file-number allocation, manifest journaling,
//! and recovery.
//!
//! On disk the version set owns two kinds of files inside the store
//! directory:
//!
//! - `CURRENT` — plain text, naming the live manifest. Updated by writing a
//!   `.TMP` sibling, syncing it, and renaming over `CURRENT`, so a crash
//!   leaves it pointing at either the old or the new manifest, never at
//!   garbage.
//! - `MANIFEST-NNNNNN` — a framed append-only journal of edit logs (framing
//!   in [`crate::encoding`]).
//!
//! Recovery replays every intact frame of the named manifest, then rolls a
//! fresh manifest seeded with a full snapshot of the recovered state and
//! swings `CURRENT` over to it.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::StoreConfig;
use crate::encoding::{FrameReader, FrameWriter};
use crate::error::Result;
use crate::kv::version::edit::{Edit, EditLog, STORE_FAMILY_ID};
use crate::kv::version::family::FamilyVersion;
use crate::kv::version::version::Version;
use crate::Error;

/// Name of the pointer file naming the live manifest.
pub const CURRENT_FILE: &str = "CURRENT";

const TMP_SUFFIX: &str = "TMP";

/// Manifest file name for the given file number.
pub fn manifest_file_name(file_number: i64) -> String {
    format!("MANIFEST-{:06}", file_number)
}

/// Table file name for the given file number.
pub fn table_file_name(file_number: i64) -> String {
    format!("{:06}.sst", file_number)
}

struct Families {
    by_name: HashMap<String, Arc<FamilyVersion>>,
    by_id: HashMap<i64, String>,
    manifest: Option<FrameWriter>,
}

/// Maintains all metadata for one kv store.
pub struct StoreVersionSet {
    store_path: PathBuf,
    num_of_levels: usize,
    manifest_file_number: AtomicI64,
    next_file_number: AtomicI64,
    version_id: AtomicI64,
    inner: RwLock<Families>,
}

impl StoreVersionSet {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store_path: config.dir,
            num_of_levels: config.num_of_levels,
            // Defaults for an uninitialized store: the first manifest is
            // MANIFEST-000001 and table numbers start at 2.
            manifest_file_number: AtomicI64::new(1),
            next_file_number: AtomicI64::new(2),
            version_id: AtomicI64::new(0),
            inner: RwLock::new(Families {
                by_name: HashMap::new(),
                by_id: HashMap::new(),
                manifest: None,
            }),
        })
    }

    /// Generates the next globally unique file number.
    pub fn next_file_number(&self) -> i64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// The current manifest identifier.
    pub fn manifest_file_number(&self) -> i64 {
        self.manifest_file_number.load(Ordering::SeqCst)
    }

    pub fn num_of_levels(&self) -> usize {
        self.num_of_levels
    }

    fn new_version_id(&self) -> i64 {
        self.version_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates a family version, or returns the existing one.
    pub fn create_family_version(&self, family: &str, family_id: i64) -> Arc<FamilyVersion> {
        if let Some(existing) = self.get_family_version(family) {
            tracing::warn!(family = family, "family version exists, using it");
            return existing;
        }

        let initial = Version::new(self.new_version_id(), self.num_of_levels);
        let family_version = Arc::new(FamilyVersion::new(family_id, family, initial));

        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .by_name
            .entry(family.to_string())
            .or_insert_with(|| family_version.clone())
            .clone();
        inner.by_id.insert(family_id, family.to_string());
        entry
    }

    pub fn get_family_version(&self, family: &str) -> Option<Arc<FamilyVersion>> {
        self.inner.read().unwrap().by_name.get(family).cloned()
    }

    fn get_family_version_by_id(&self, family_id: i64) -> Option<Arc<FamilyVersion>> {
        let inner = self.inner.read().unwrap();
        let name = inner.by_id.get(&family_id)?;
        inner.by_name.get(name).cloned()
    }

    /// Recovers the version set: initializes a fresh store when `CURRENT`
    /// is absent, otherwise replays the live manifest, then rolls a fresh
    /// manifest either way.
    ///
    /// Families must be registered before calling this; a family log for an
    /// unknown id fails with `UnknownFamily`.
    pub fn recover(&self) -> Result<()> {
        fs::create_dir_all(&self.store_path)
            .map_err(|e| Error::ManifestIO(e.to_string()))?;

        if !self.store_path.join(CURRENT_FILE).exists() {
            tracing::info!(path = %self.store_path.display(), "current file absent, initializing store");
            return self.init_journal();
        }

        tracing::info!(path = %self.store_path.display(), "recovering version set from manifest");
        self.replay()?;
        self.init_journal()
    }

    /// Closes the manifest writer, releasing the journal file.
    pub fn destroy(&self) {
        self.inner.write().unwrap().manifest = None;
    }

    /// Persists the edit log to the manifest, then installs a new head
    /// version for the family. Totally ordered by the version-set lock; the
    /// on-disk journal order matches the in-memory application order.
    pub fn commit_family_edit_log(&self, family: &str, mut edit_log: EditLog) -> Result<()> {
        let family_version = self
            .get_family_version(family)
            .ok_or_else(|| Error::UnknownFamily(family.to_string()))?;

        let mut inner = self.inner.write().unwrap();

        // Every committed log carries the allocation watermark so recovery
        // never re-issues a persisted file number.
        edit_log.add(Edit::NextFileNumber(
            self.next_file_number.load(Ordering::SeqCst),
        ));

        let payload = edit_log.marshal();
        let writer = inner.manifest.as_mut().ok_or_else(|| {
            Error::ManifestIO("manifest writer not initialized, recover() first".to_string())
        })?;
        writer.append(&payload).map_err(manifest_io)?;
        writer.sync().map_err(manifest_io)?;

        // Durable; now apply to a clone of the head and install it.
        let snapshot = family_version.snapshot();
        let mut next = snapshot.current().clone_with_id(self.new_version_id());
        next.apply(&edit_log);
        drop(snapshot);
        family_version.append_version(Arc::new(next));

        tracing::info!(
            family = family,
            edits = edit_log.edits().len(),
            "committed family edit log"
        );
        Ok(())
    }

    fn replay(&self) -> Result<()> {
        let manifest_name = self.read_manifest_file_name()?;
        let manifest_path = self.store_path.join(&manifest_name);
        let reader =
            FrameReader::open(&manifest_path).map_err(|e| Error::ManifestIO(e.to_string()))?;

        for frame in reader {
            let payload = frame.map_err(|e| Error::CorruptManifest(e.to_string()))?;
            let edit_log = EditLog::unmarshal(&payload)
                .map_err(|e| Error::CorruptManifest(e.to_string()))?;
            self.apply_edit_log(&edit_log)?;
        }
        Ok(())
    }

    fn apply_edit_log(&self, edit_log: &EditLog) -> Result<()> {
        // The allocation watermark applies to the version set no matter
        // which family the log belongs to.
        for edit in edit_log.edits() {
            if let Edit::NextFileNumber(next) = edit {
                self.set_next_file_number(*next);
            }
        }

        if edit_log.family_id() == STORE_FAMILY_ID {
            return Ok(());
        }

        let family_version = self
            .get_family_version_by_id(edit_log.family_id())
            .ok_or_else(|| {
                Error::UnknownFamily(format!("family id {}", edit_log.family_id()))
            })?;

        let snapshot = family_version.snapshot();
        let mut next = snapshot.current().clone_with_id(self.new_version_id());
        next.apply(edit_log);
        drop(snapshot);
        family_version.append_version(Arc::new(next));
        Ok(())
    }

    fn set_next_file_number(&self, next: i64) {
        self.manifest_file_number.store(next, Ordering::SeqCst);
        self.next_file_number.store(next + 1, Ordering::SeqCst);
    }

    /// Rolls a fresh manifest: writes a full snapshot of the in-memory
    /// state, syncs it, and only then swings `CURRENT` over.
    fn init_journal(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.manifest.is_some() {
            return Ok(());
        }

        let manifest_name = manifest_file_name(self.manifest_file_number());
        let manifest_path = self.store_path.join(&manifest_name);
        let mut writer = FrameWriter::create(&manifest_path).map_err(manifest_io)?;

        for edit_log in self.create_snapshot(&inner) {
            writer.append(&edit_log.marshal()).map_err(manifest_io)?;
            writer.sync().map_err(manifest_io)?;
        }

        // The snapshot must be durable before CURRENT names the new file.
        self.set_current(&manifest_name)?;
        inner.manifest = Some(writer);
        Ok(())
    }

    fn create_snapshot(&self, families: &Families) -> Vec<EditLog> {
        let mut edit_logs = Vec::new();

        for family_version in families.by_name.values() {
            let snapshot = family_version.snapshot();
            let mut edit_log = EditLog::new(family_version.family_id());
            for (level, file) in snapshot.current().all_files() {
                edit_log.add(Edit::NewFile { level, file });
            }
            edit_logs.push(edit_log);
        }

        let mut store_log = EditLog::new(STORE_FAMILY_ID);
        store_log.add(Edit::NextFileNumber(
            self.next_file_number.load(Ordering::SeqCst),
        ));
        edit_logs.push(store_log);
        edit_logs
    }

    fn read_manifest_file_name(&self) -> Result<String> {
        let current = self.store_path.join(CURRENT_FILE);
        let name = fs::read_to_string(&current).map_err(|e| Error::ManifestIO(e.to_string()))?;
        Ok(name.trim().to_string())
    }

    fn set_current(&self, manifest_name: &str) -> Result<()> {
        let current = self.store_path.join(CURRENT_FILE);
        let tmp = self
            .store_path
            .join(format!("{}.{}", CURRENT_FILE, TMP_SUFFIX));

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(manifest_name.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &current)
        };
        write().map_err(|e| Error::ManifestIO(e.to_string()))
    }
}

fn manifest_io(err: Error) -> Error {
    match err {
        Error::IO(msg) => Error::ManifestIO(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::version::version::FileMeta;
    use crate::tmpfs::TempDir;
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::{Seek, SeekFrom};

    fn meta(file_number: i64) -> FileMeta {
        FileMeta {
            file_number,
            min_key: vec![1],
            max_key: vec![9],
            size: 256,
        }
    }

    fn open_set(dir: &TempDir) -> StoreVersionSet {
        StoreVersionSet::new(StoreConfig::new(dir.path())).expect("config is valid")
    }

    #[test]
    fn test_file_names() {
        assert_eq!(manifest_file_name(123), "MANIFEST-000123");
        assert_eq!(table_file_name(7), "000007.sst");
    }

    #[test]
    fn test_initialize_fresh_store() -> Result<()> {
        let dir = TempDir::new()?;
        let set = open_set(&dir);
        set.recover()?;

        let current = fs::read_to_string(dir.path().join(CURRENT_FILE))?;
        assert_eq!(current, "MANIFEST-000001");
        assert!(dir.path().join("MANIFEST-000001").exists());

        assert_eq!(set.next_file_number(), 2);
        assert_eq!(set.next_file_number(), 3);
        Ok(())
    }

    #[test]
    fn test_commit_requires_known_family() -> Result<()> {
        let dir = TempDir::new()?;
        let set = open_set(&dir);
        set.recover()?;

        let result = set.commit_family_edit_log("missing", EditLog::new(1));
        assert!(matches!(result, Err(Error::UnknownFamily(_))));
        Ok(())
    }

    #[test]
    fn test_create_family_version_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let set = open_set(&dir);

        let first = set.create_family_version("f", 1);
        let second = set.create_family_version("f", 1);
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }

    #[test]
    fn test_commit_and_recover_level_state() -> Result<()> {
        let dir = TempDir::new()?;

        {
            let set = open_set(&dir);
            set.create_family_version("f", 1);
            set.recover()?;

            let mut log = EditLog::new(1);
            log.add(Edit::NewFile {
                level: 0,
                file: meta(3),
            });
            set.commit_family_edit_log("f", log)?;

            let mut log = EditLog::new(1);
            log.add(Edit::NewFile {
                level: 0,
                file: meta(4),
            });
            log.add(Edit::DeleteFile {
                level: 0,
                file_number: 3,
            });
            set.commit_family_edit_log("f", log)?;

            let family = set.get_family_version("f").unwrap();
            let snapshot = family.snapshot();
            let numbers: Vec<_> = snapshot
                .current()
                .level(0)
                .unwrap()
                .files()
                .iter()
                .map(|f| f.file_number)
                .collect();
            assert_eq!(numbers, vec![4]);
        }

        // Kill and recover.
        let set = open_set(&dir);
        let family = set.create_family_version("f", 1);
        set.recover()?;

        let snapshot = family.snapshot();
        let numbers: Vec<_> = snapshot
            .current()
            .level(0)
            .unwrap()
            .files()
            .iter()
            .map(|f| f.file_number)
            .collect();
        assert_eq!(numbers, vec![4]);
        Ok(())
    }

    #[test]
    fn test_recover_rolls_manifest_and_swings_current() -> Result<()> {
        let dir = TempDir::new()?;

        {
            let set = open_set(&dir);
            set.create_family_version("f", 1);
            set.recover()?;

            let mut log = EditLog::new(1);
            log.add(Edit::NewFile {
                level: 0,
                file: meta(set.next_file_number()),
            });
            set.commit_family_edit_log("f", log)?;
        }

        let set = open_set(&dir);
        set.create_family_version("f", 1);
        set.recover()?;

        let current = fs::read_to_string(dir.path().join(CURRENT_FILE))?;
        assert_ne!(current, "MANIFEST-000001");
        assert!(dir.path().join(current.trim()).exists());
        Ok(())
    }

    #[test]
    fn test_torn_trailing_frame_is_discarded() -> Result<()> {
        let dir = TempDir::new()?;
        let discarded_number;

        {
            let set = open_set(&dir);
            set.create_family_version("f", 1);
            set.recover()?;

            let committed = set.next_file_number();
            let mut log = EditLog::new(1);
            log.add(Edit::NewFile {
                level: 0,
                file: meta(committed),
            });
            set.commit_family_edit_log("f", log)?;

            // Simulate a crash mid-append: the next edit log's frame makes
            // it to disk without its checksum.
            discarded_number = set.next_file_number();
            let mut torn = EditLog::new(1);
            torn.add(Edit::NewFile {
                level: 0,
                file: meta(discarded_number),
            });
            let payload = torn.marshal();

            let manifest = dir
                .path()
                .join(manifest_file_name(set.manifest_file_number()));
            let mut file = fs::OpenOptions::new().append(true).open(manifest)?;
            file.write_u32::<BigEndian>(payload.len() as u32)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }

        let set = open_set(&dir);
        let family = set.create_family_version("f", 1);
        set.recover()?;

        // Prior committed state is preserved, the torn edit is gone.
        let snapshot = family.snapshot();
        let numbers: Vec<_> = snapshot
            .current()
            .level(0)
            .unwrap()
            .files()
            .iter()
            .map(|f| f.file_number)
            .collect();
        assert_eq!(numbers.len(), 1);
        assert!(!numbers.contains(&discarded_number));

        // And new allocations never collide with the discarded number.
        assert!(set.next_file_number() > discarded_number);
        Ok(())
    }

    #[test]
    fn test_corrupt_frame_fails_recovery() -> Result<()> {
        let dir = TempDir::new()?;

        {
            let set = open_set(&dir);
            set.create_family_version("f", 1);
            set.recover()?;

            let mut log = EditLog::new(1);
            log.add(Edit::NewFile {
                level: 0,
                file: meta(3),
            });
            set.commit_family_edit_log("f", log)?;
        }

        // Flip a payload byte of the first frame, leaving it complete.
        let manifest_name = fs::read_to_string(dir.path().join(CURRENT_FILE))?;
        let manifest = dir.path().join(manifest_name.trim());
        let mut file = fs::OpenOptions::new().read(true).write(true).open(manifest)?;
        file.seek(SeekFrom::Start(4))?;
        file.write_all(&[0xFF])?;
        file.sync_all()?;

        let set = open_set(&dir);
        set.create_family_version("f", 1);
        assert!(matches!(set.recover(), Err(Error::CorruptManifest(_))));
        Ok(())
    }

    #[test]
    fn test_snapshot_isolated_from_commits() -> Result<()> {
        let dir = TempDir::new()?;
        let set = open_set(&dir);
        let family = set.create_family_version("f", 1);
        set.recover()?;

        let pinned = family.snapshot();

        let mut log = EditLog::new(1);
        log.add(Edit::NewFile {
            level: 0,
            file: meta(3),
        });
        set.commit_family_edit_log("f", log)?;

        assert!(pinned.current().level(0).unwrap().is_empty());
        assert_eq!(family.snapshot().current().level(0).unwrap().files().len(), 1);
        Ok(())
    }
}
