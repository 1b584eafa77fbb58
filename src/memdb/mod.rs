//! In-memory write path of a storage node.
//!
//! Points flow through a fixed fan-out of shards into per-metric stores:
//!
//! ```text
//! Point ──fnv1a(name)──► Shard ──► MetricStore ──► TsStore ──► FieldStore
//!                                      │
//!                              mutable VersionedTsMap
//!                              frozen  VersionedTsMap(s) ──flush──► TableWriter
//! ```
//!
//! Each metric store owns one mutable versioned map taking writes and a list
//! of frozen predecessors awaiting flush. Freezing happens on reset or when
//! a family flush begins; flushing drains one family bucket out of the
//! frozen maps into a level-0 table file whose metadata feeds the version
//! set.
//!
//! Three background tasks keep the database bounded: the evictor (coalesced
//! capacity-1 signal channel), the limit updater (per-metric tag-limit
//! subscriptions), and the id syncer (periodic id pre-assignment).

pub mod database;
pub mod field_store;
pub(crate) mod flush;
pub mod id_generator;
pub mod metric_store;
pub mod ts_store;

pub use database::MemoryDatabase;
pub use field_store::FieldStore;
pub use id_generator::{IdGenerator, MetaStore};
pub use metric_store::{MetricStore, VersionedTsMap};
pub use ts_store::TsStore;

/// Wall clock in milliseconds since the epoch.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_millis() as i64
}
