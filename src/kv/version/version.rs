//! Versions: immutable snapshots of a family's level -> file-list mapping.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::kv::version::edit::{Edit, EditLog};

/// Metadata of one on-disk table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub file_number: i64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub size: i64,
}

/// One level of a version: a sorted list of file metadata.
///
/// Level 0 files may overlap and are ordered by file number; levels >= 1
/// hold disjoint ranges and are ordered by min key.
#[derive(Debug, Clone)]
pub struct Level {
    num: i32,
    files: Vec<FileMeta>,
}

impl Level {
    pub fn new(num: i32) -> Self {
        Self {
            num,
            files: Vec::new(),
        }
    }

    pub fn num(&self) -> i32 {
        self.num
    }

    pub fn files(&self) -> &[FileMeta] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Inserts a file preserving sort order. Re-adding an existing file
    /// number replaces its metadata, so replaying an edit log is idempotent.
    pub fn add_file(&mut self, file: FileMeta) {
        self.files.retain(|f| f.file_number != file.file_number);
        let pos = if self.num == 0 {
            self.files
                .partition_point(|f| f.file_number < file.file_number)
        } else {
            self.files.partition_point(|f| f.min_key < file.min_key)
        };
        self.files.insert(pos, file);
    }

    /// Removes the file with the given number; missing is a no-op.
    pub fn delete_file(&mut self, file_number: i64) {
        self.files.retain(|f| f.file_number != file_number);
    }
}

/// A snapshot of one family's file layout across levels.
///
/// A version is mutated only while being built from its predecessor; once
/// installed into a family's chain it is shared read-only. The reference
/// count tracks open snapshots, not memory ownership.
#[derive(Debug)]
pub struct Version {
    id: i64,
    levels: Vec<Level>,
    refs: AtomicI32,
}

impl Version {
    pub fn new(id: i64, num_of_levels: usize) -> Self {
        let levels = (0..num_of_levels).map(|n| Level::new(n as i32)).collect();
        Self {
            id,
            levels,
            refs: AtomicI32::new(0),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn level(&self, num: usize) -> Option<&Level> {
        self.levels.get(num)
    }

    /// Files whose key range may contain `key`, searched from level 0 down.
    /// Level 0 can contribute several overlapping files; lower levels at
    /// most one each.
    pub fn find_files(&self, key: &[u8]) -> Vec<&FileMeta> {
        self.levels
            .iter()
            .flat_map(|level| level.files.iter())
            .filter(|f| f.min_key.as_slice() <= key && key <= f.max_key.as_slice())
            .collect()
    }

    /// All files across all levels, level order then in-level order.
    pub fn all_files(&self) -> Vec<(i32, FileMeta)> {
        self.levels
            .iter()
            .flat_map(|level| level.files.iter().map(|f| (level.num, f.clone())))
            .collect()
    }

    /// Deep copy with a fresh id and a zero reference count.
    pub fn clone_with_id(&self, id: i64) -> Version {
        Version {
            id,
            levels: self.levels.clone(),
            refs: AtomicI32::new(0),
        }
    }

    /// Applies an edit log's file mutations in insertion order.
    /// `NextFileNumber` edits belong to the version set and are skipped here.
    pub fn apply(&mut self, log: &EditLog) {
        for edit in log.edits() {
            match edit {
                Edit::NewFile { level, file } => match self.levels.get_mut(*level as usize) {
                    Some(l) => l.add_file(file.clone()),
                    None => tracing::error!(
                        level = level,
                        file_number = file.file_number,
                        "new-file edit targets a level out of range"
                    ),
                },
                Edit::DeleteFile { level, file_number } => {
                    match self.levels.get_mut(*level as usize) {
                        Some(l) => l.delete_file(*file_number),
                        None => tracing::error!(
                            level = level,
                            file_number = file_number,
                            "delete-file edit targets a level out of range"
                        ),
                    }
                }
                Edit::NextFileNumber(_) => {}
            }
        }
    }

    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn num_of_refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }
}
