//! Table-writer collaborator contract.
//!
//! The block codec behind this trait is owned by the storage layer; the
//! memory database only drives it. One flush call produces one level-0
//! table: `prepare` once per metric, `append_time_series` once per
//! (tag, field) series, and a single `commit` that seals the file and
//! reports its metadata for the version-set edit log.

use crate::error::Result;
use crate::kv::version::FileMeta;
use crate::point::FieldKind;

pub trait TableWriter: Send {
    /// Begins a metric section. Uncommitted sections are discarded if the
    /// flush is retried.
    fn prepare(&mut self, metric_id: i32) -> Result<()>;

    /// Appends one time-series: the encoded slot values of one field under
    /// one tag-set.
    fn append_time_series(
        &mut self,
        tag_id: i64,
        field_id: i16,
        kind: FieldKind,
        series: &[u8],
    ) -> Result<()>;

    /// Seals the table file and returns its metadata.
    fn commit(&mut self) -> Result<FileMeta>;
}
