//! Version metadata for a kv store.
//!
//! The version subsystem is a write-ahead log for store structure rather
//! than user data: which table files exist, at which level, and in which
//! family. Each mutation batch is an [`EditLog`]; committed logs are framed
//! into the manifest journal and folded into an in-memory [`Version`] chain
//! per family.
//!
//! ```text
//!  flush/compaction ──EditLog──► StoreVersionSet ──frame──► MANIFEST-NNNNNN
//!                                     │                          ▲
//!                                     ▼                          │
//!                               FamilyVersion ◄────replay────────┘
//!                               (version chain)
//! ```
//!
//! Readers pin a [`Version`] through a refcounted [`Snapshot`] so flushes
//! and compactions never mutate a file list out from under them.

pub mod edit;
pub mod family;
pub mod set;
#[allow(clippy::module_inception)]
pub mod version;

pub use edit::{Edit, EditLog, STORE_FAMILY_ID};
pub use family::{FamilyVersion, Snapshot};
pub use set::{manifest_file_name, table_file_name, StoreVersionSet, CURRENT_FILE};
pub use version::{FileMeta, Level, Version};
