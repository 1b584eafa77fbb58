//! The family-flush path: drain one family bucket out of frozen maps into a
//! level-0 table file.

use crate::error::Result;
use crate::kv::version::FileMeta;
use crate::memdb::database::MemoryDatabase;
use crate::memdb::metric_store::MetricStore;
use crate::table::TableWriter;
use crate::Error;
use std::sync::Arc;

/// Bounded retries for transient table-writer failures within one flush.
const MAX_FLUSH_RETRIES: usize = 3;

/// Flushes every metric's data for `family_time` to `writer`.
///
/// Mutable maps still holding the family are frozen first, so the flush
/// reflects every write that succeeded before this call; writes racing the
/// freeze land in the fresh mutable map and flush next time.
///
/// The write-out is retried up to [`MAX_FLUSH_RETRIES`] times; only after a
/// successful `commit` is the family's data removed from the frozen maps
/// (a frozen map is dropped once its family set empties). On exhausted
/// retries everything is retained and the error surfaces.
pub(crate) async fn flush_family_to(
    db: &MemoryDatabase,
    family_time: i64,
    writer: &mut dyn TableWriter,
) -> Result<Option<FileMeta>> {
    let interval_ms = db.interval_ms();
    let stores = db.all_stores();

    for store in &stores {
        let holds_family = store
            .maps()
            .read()
            .unwrap()
            .mutable
            .family_times
            .contains(&family_time);
        if holds_family {
            store.freeze();
        }
    }

    let mut attempt = 0;
    let file = loop {
        if db.is_closed() {
            return Err(Error::Cancelled);
        }

        match write_family(db, &stores, family_time, interval_ms, writer) {
            Ok(None) => return Ok(None),
            Ok(Some(file)) => break file,
            Err(err) => {
                attempt += 1;
                if attempt > MAX_FLUSH_RETRIES {
                    tracing::error!(
                        family_time,
                        error = %err,
                        "flush failed, retaining frozen maps"
                    );
                    return Err(err);
                }
                tracing::warn!(
                    family_time,
                    attempt,
                    error = %err,
                    "flush attempt failed, retrying"
                );
            }
        }
    };

    evict_family(&stores, family_time, interval_ms);
    tracing::info!(
        family_time,
        file_number = file.file_number,
        "flushed family to table file"
    );
    Ok(Some(file))
}

/// Streams the family's series to the writer and commits. Read-only with
/// respect to the metric stores.
fn write_family(
    db: &MemoryDatabase,
    stores: &[Arc<MetricStore>],
    family_time: i64,
    interval_ms: i64,
    writer: &mut dyn TableWriter,
) -> Result<Option<FileMeta>> {
    let mut wrote_any = false;

    for store in stores {
        let maps = store.maps().read().unwrap();
        if !maps
            .immutable
            .iter()
            .any(|m| m.family_times.contains(&family_time))
        {
            continue;
        }

        let metric_id = db.generator().gen_metric_id(store.name())?;
        writer.prepare(metric_id)?;

        for map in maps
            .immutable
            .iter()
            .filter(|m| m.family_times.contains(&family_time))
        {
            for (tags, ts_store) in &map.series {
                let tag_id = db.generator().gen_tag_id(metric_id, tags)?;

                for (field_name, field_store) in ts_store.fields() {
                    let slots = field_store.family_slots(family_time, interval_ms);
                    if slots.is_empty() {
                        continue;
                    }

                    let field_id = match db.generator().gen_field_id(
                        metric_id,
                        field_name,
                        field_store.kind(),
                    ) {
                        Ok(id) => id,
                        Err(Error::FieldKindMismatch(field)) => {
                            tracing::warn!(
                                metric = store.name(),
                                field = field.as_str(),
                                "field registered with a different kind, not flushed"
                            );
                            continue;
                        }
                        Err(err) => return Err(err),
                    };

                    let series = bincode::serialize(&slots)?;
                    writer.append_time_series(tag_id, field_id, field_store.kind(), &series)?;
                    wrote_any = true;
                }
            }
        }
    }

    if !wrote_any {
        return Ok(None);
    }
    writer.commit().map(Some)
}

/// Removes the flushed family from every frozen map and drops maps whose
/// family set emptied. Kept maps keep their tag-sets, so frozen cardinality
/// stays frozen.
fn evict_family(stores: &[Arc<MetricStore>], family_time: i64, interval_ms: i64) {
    for store in stores {
        let mut maps = store.maps().write().unwrap();
        for map in &mut maps.immutable {
            if !map.family_times.contains(&family_time) {
                continue;
            }
            for ts_store in map.series.values_mut() {
                for field_store in ts_store.fields_mut().values_mut() {
                    field_store.evict_family(family_time, interval_ms);
                }
            }
            map.family_times.remove(&family_time);
        }
        maps.immutable.retain(|m| !m.family_times.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemDbConfig, StoreConfig};
    use crate::kv::version::{Edit, EditLog, StoreVersionSet};
    use crate::memdb::id_generator::MetaStore;
    use crate::point::{FieldKind, FieldValue, Point};
    use crate::tmpfs::TempDir;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Table-writer double that records appended series and can inject
    /// failures. A failed attempt marks the recording dirty; the next
    /// `prepare` discards the uncommitted rows, the way a real writer
    /// drops an unsealed file.
    #[derive(Default)]
    struct RecordingWriter {
        current_metric: Option<i32>,
        rows: Vec<(i32, i64, i16, FieldKind, Vec<u8>)>,
        committed: bool,
        fail_appends: usize,
        dirty: bool,
    }

    impl TableWriter for RecordingWriter {
        fn prepare(&mut self, metric_id: i32) -> Result<()> {
            if self.dirty {
                self.rows.clear();
                self.dirty = false;
            }
            self.current_metric = Some(metric_id);
            Ok(())
        }

        fn append_time_series(
            &mut self,
            tag_id: i64,
            field_id: i16,
            kind: FieldKind,
            series: &[u8],
        ) -> Result<()> {
            if self.fail_appends > 0 {
                self.fail_appends -= 1;
                self.dirty = true;
                return Err(Error::IO("injected write failure".to_string()));
            }
            let metric_id = self.current_metric.expect("prepare called first");
            self.rows
                .push((metric_id, tag_id, field_id, kind, series.to_vec()));
            Ok(())
        }

        fn commit(&mut self) -> Result<FileMeta> {
            self.committed = true;
            Ok(FileMeta {
                file_number: 7,
                min_key: vec![0],
                max_key: vec![255],
                size: self.rows.len() as i64 * 64,
            })
        }
    }

    fn test_db(config: MemDbConfig) -> (Arc<MemoryDatabase>, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let generator = Arc::new(MetaStore::open(dir.file("meta")).expect("meta store"));
        let db = MemoryDatabase::new(config, generator).expect("database");
        (db, dir)
    }

    fn second_config() -> MemDbConfig {
        MemDbConfig::default().family_interval(Duration::from_secs(1))
    }

    fn point(name: &str, tags: &str, timestamp: i64, value: f64) -> Point {
        let mut fields = HashMap::new();
        fields.insert("total".to_string(), FieldValue::Sum(value));
        Point {
            name: name.to_string(),
            tags: tags.to_string(),
            timestamp,
            fields,
        }
    }

    #[tokio::test]
    async fn test_flush_family_removes_it_from_families() -> Result<()> {
        let (db, _dir) = test_db(second_config());

        db.write(&point("cpu.load", "host=a", 2_100, 1.0))?;
        db.write(&point("cpu.load", "host=a", 4_100, 2.0))?;
        assert_eq!(db.families(), vec![2, 4]);

        let mut writer = RecordingWriter::default();
        let file = db.flush_family_to(2, &mut writer).await?;

        assert!(file.is_some());
        assert!(writer.committed);
        assert_eq!(db.families(), vec![4]);

        db.close().await
    }

    #[tokio::test]
    async fn test_flush_streams_every_series_once() -> Result<()> {
        let (db, _dir) = test_db(second_config());

        db.write(&point("cpu.load", "host=a", 2_100, 1.0))?;
        db.write(&point("cpu.load", "host=a", 2_200, 2.0))?;
        db.write(&point("cpu.load", "host=b", 2_300, 3.0))?;
        db.write(&point("mem.used", "host=a", 2_400, 4.0))?;

        let mut writer = RecordingWriter::default();
        db.flush_family_to(2, &mut writer).await?;

        // One row per (metric, tag-set, field).
        assert_eq!(writer.rows.len(), 3);

        // host=a's series carries both slots, merged where timestamps met.
        let cpu_id = db.generator().gen_metric_id("cpu.load")?;
        let tag_a = db.generator().gen_tag_id(cpu_id, "host=a")?;
        let row = writer
            .rows
            .iter()
            .find(|(m, t, _, _, _)| *m == cpu_id && *t == tag_a)
            .expect("host=a series flushed");
        let slots: Vec<(i64, FieldValue)> = bincode::deserialize(&row.4).unwrap();
        assert_eq!(
            slots,
            vec![(2_100, FieldValue::Sum(1.0)), (2_200, FieldValue::Sum(2.0))]
        );

        db.close().await
    }

    #[tokio::test]
    async fn test_flush_without_data_commits_nothing() -> Result<()> {
        let (db, _dir) = test_db(second_config());

        let mut writer = RecordingWriter::default();
        let file = db.flush_family_to(9, &mut writer).await?;

        assert!(file.is_none());
        assert!(!writer.committed);

        db.close().await
    }

    #[tokio::test]
    async fn test_flush_retries_transient_failures() -> Result<()> {
        let (db, _dir) = test_db(second_config());
        db.write(&point("cpu.load", "host=a", 2_100, 1.0))?;

        let mut writer = RecordingWriter {
            fail_appends: 2,
            ..Default::default()
        };
        let file = db.flush_family_to(2, &mut writer).await?;

        assert!(file.is_some());
        assert_eq!(writer.rows.len(), 1);
        assert_eq!(db.families(), Vec::<i64>::new());

        db.close().await
    }

    #[tokio::test]
    async fn test_flush_retains_data_after_exhausted_retries() -> Result<()> {
        let (db, _dir) = test_db(second_config());
        db.write(&point("cpu.load", "host=a", 2_100, 1.0))?;

        let mut writer = RecordingWriter {
            fail_appends: usize::MAX,
            ..Default::default()
        };
        let result = db.flush_family_to(2, &mut writer).await;

        assert!(matches!(result, Err(Error::IO(_))));
        // The frozen map survives for the next attempt.
        assert_eq!(db.families(), vec![2]);

        let mut writer = RecordingWriter::default();
        assert!(db.flush_family_to(2, &mut writer).await?.is_some());
        assert_eq!(db.families(), Vec::<i64>::new());

        db.close().await
    }

    #[tokio::test]
    async fn test_flush_keeps_co_resident_families() -> Result<()> {
        let (db, _dir) = test_db(second_config());

        // Both families land in the same frozen map.
        db.write(&point("cpu.load", "host=a", 2_100, 1.0))?;
        db.write(&point("cpu.load", "host=a", 4_100, 2.0))?;

        let mut writer = RecordingWriter::default();
        db.flush_family_to(2, &mut writer).await?;

        // Family 4 is still flushable afterwards.
        let mut writer = RecordingWriter::default();
        let file = db.flush_family_to(4, &mut writer).await?;
        assert!(file.is_some());
        let slots: Vec<(i64, FieldValue)> = bincode::deserialize(&writer.rows[0].4).unwrap();
        assert_eq!(slots, vec![(4_100, FieldValue::Sum(2.0))]);

        db.close().await
    }

    #[tokio::test]
    async fn test_flush_feeds_the_version_set() -> Result<()> {
        let (db, dir) = test_db(second_config());
        db.write(&point("cpu.load", "host=a", 2_100, 1.0))?;

        let set = StoreVersionSet::new(StoreConfig::new(dir.path().join("kv")))?;
        let family = set.create_family_version("day-2", 2);
        set.recover()?;

        let mut writer = RecordingWriter::default();
        let file = db
            .flush_family_to(2, &mut writer)
            .await?
            .expect("family had data");

        let mut log = EditLog::new(2);
        log.add(Edit::NewFile {
            level: 0,
            file: file.clone(),
        });
        set.commit_family_edit_log("day-2", log)?;

        let snapshot = family.snapshot();
        assert_eq!(
            snapshot.current().level(0).unwrap().files(),
            std::slice::from_ref(&file)
        );

        db.close().await
    }
}
