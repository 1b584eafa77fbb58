//! Per-family version chains with snapshot pinning.

use std::sync::{Arc, Mutex};

use crate::kv::version::version::Version;

/// Pins one [`Version`] so readers see a consistent file list while
/// compactions and flushes install new heads. Released on drop.
pub struct Snapshot {
    version: Arc<Version>,
}

impl Snapshot {
    fn new(version: Arc<Version>) -> Self {
        version.retain();
        Self { version }
    }

    pub fn current(&self) -> &Version {
        &self.version
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.version.release();
    }
}

/// Ordered list of versions for one family; the last entry is the head.
///
/// A version that is no longer head and has no open snapshots is unlinked
/// from the chain when a new head is appended.
pub struct FamilyVersion {
    family_id: i64,
    family_name: String,
    chain: Mutex<Vec<Arc<Version>>>,
}

impl FamilyVersion {
    pub fn new(family_id: i64, family_name: impl Into<String>, initial: Version) -> Self {
        Self {
            family_id,
            family_name: family_name.into(),
            chain: Mutex::new(vec![Arc::new(initial)]),
        }
    }

    pub fn family_id(&self) -> i64 {
        self.family_id
    }

    pub fn family_name(&self) -> &str {
        &self.family_name
    }

    /// Acquires a snapshot of the current head.
    pub fn snapshot(&self) -> Snapshot {
        let chain = self.chain.lock().unwrap();
        let head = chain.last().expect("family version chain is never empty");
        Snapshot::new(head.clone())
    }

    /// Installs `version` as the new head and unlinks unreferenced
    /// predecessors.
    pub fn append_version(&self, version: Arc<Version>) {
        let mut chain = self.chain.lock().unwrap();
        chain.push(version);

        let head_id = chain.last().unwrap().id();
        chain.retain(|v| v.id() == head_id || v.num_of_refs() > 0);
    }

    #[cfg(test)]
    pub(crate) fn chain_len(&self) -> usize {
        self.chain.lock().unwrap().len()
    }
}
