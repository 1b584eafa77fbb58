//! Per-metric storage: a mutable versioned tag-set map plus frozen
//! predecessors awaiting flush.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use crate::error::Result;
use crate::memdb::now_millis;
use crate::memdb::ts_store::TsStore;
use crate::point::Point;
use crate::Error;

/// A snapshot of one metric's tag-set -> ts-store map with a monotonic
/// version id (wall-clock millis at creation). Freezable: once moved to the
/// immutable list its tag cardinality never changes.
#[derive(Debug)]
pub struct VersionedTsMap {
    pub(crate) version: i64,
    pub(crate) series: HashMap<String, TsStore>,
    pub(crate) family_times: HashSet<i64>,
}

impl VersionedTsMap {
    pub fn new() -> Self {
        Self {
            version: now_millis(),
            series: HashMap::new(),
            family_times: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl Default for VersionedTsMap {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub(crate) struct TsMaps {
    pub(crate) mutable: VersionedTsMap,
    pub(crate) immutable: Vec<VersionedTsMap>,
}

/// Owns all in-memory state for one metric.
pub struct MetricStore {
    name: String,
    maps: RwLock<TsMaps>,
    max_tags_limit: AtomicU32,
}

impl MetricStore {
    pub fn new(name: impl Into<String>, max_tags_limit: u32) -> Self {
        Self {
            name: name.into(),
            maps: RwLock::new(TsMaps::default()),
            max_tags_limit: AtomicU32::new(max_tags_limit),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_tags_limit(&self) -> u32 {
        self.max_tags_limit.load(Ordering::SeqCst)
    }

    pub fn set_max_tags_limit(&self, limit: u32) {
        self.max_tags_limit.store(limit, Ordering::SeqCst);
    }

    /// Distinct tag-sets across the mutable and immutable maps.
    pub fn tag_count(&self) -> usize {
        let maps = self.maps.read().unwrap();
        maps.mutable.series.len() + maps.immutable.iter().map(|m| m.series.len()).sum::<usize>()
    }

    /// Ensures the tag-set's ts-store exists in the mutable map, enforcing
    /// the tag limit. Creation past the limit fails with `TooManyTags` and
    /// changes nothing.
    pub fn get_or_create_ts_store(&self, tag_set: &str) -> Result<()> {
        let mut maps = self.maps.write().unwrap();
        self.ensure_series(&mut maps, tag_set)
    }

    fn ensure_series(&self, maps: &mut TsMaps, tag_set: &str) -> Result<()> {
        if maps.mutable.series.contains_key(tag_set) {
            return Ok(());
        }
        let total =
            maps.mutable.series.len() + maps.immutable.iter().map(|m| m.series.len()).sum::<usize>();
        let limit = self.max_tags_limit();
        if total >= limit as usize {
            return Err(Error::TooManyTags(format!(
                "metric {} is at its tag limit of {}",
                self.name, limit
            )));
        }
        maps.mutable.series.insert(tag_set.to_string(), TsStore::new());
        Ok(())
    }

    /// Writes a point's fields into the mutable map, creating the tag-set's
    /// ts-store if absent.
    pub fn write(&self, point: &Point, family_time: i64) -> Result<()> {
        let mut maps = self.maps.write().unwrap();
        self.ensure_series(&mut maps, &point.tags)?;

        let ts_store = maps
            .mutable
            .series
            .get_mut(&point.tags)
            .expect("series ensured above");
        ts_store.write(point.timestamp, &point.fields);
        maps.mutable.family_times.insert(family_time);
        Ok(())
    }

    /// Moves the mutable map to the tail of the immutable list and starts a
    /// fresh one.
    pub fn freeze(&self) {
        let mut maps = self.maps.write().unwrap();
        let frozen = std::mem::take(&mut maps.mutable);
        maps.immutable.push(frozen);
        tracing::debug!(metric = self.name.as_str(), "froze versioned ts map");
    }

    pub fn mutable_version(&self) -> i64 {
        self.maps.read().unwrap().mutable.version
    }

    /// Union of family-time buckets across mutable + immutable maps.
    pub fn family_times(&self) -> HashSet<i64> {
        let maps = self.maps.read().unwrap();
        let mut times: HashSet<i64> = maps.mutable.family_times.clone();
        for map in &maps.immutable {
            times.extend(map.family_times.iter().copied());
        }
        times
    }

    /// A store is evictable once its mutable map is empty and every frozen
    /// map has been idle past the TTL.
    pub fn is_evictable(&self, now_ms: i64, ttl_ms: i64) -> bool {
        let maps = self.maps.read().unwrap();
        maps.mutable.series.is_empty()
            && maps.immutable.iter().all(|m| now_ms - m.version > ttl_ms)
    }

    pub(crate) fn maps(&self) -> &RwLock<TsMaps> {
        &self.maps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::FieldValue;

    fn point(tags: &str, timestamp: i64) -> Point {
        let mut fields = HashMap::new();
        fields.insert("value".to_string(), FieldValue::Sum(1.0));
        Point {
            name: "cpu.load".to_string(),
            tags: tags.to_string(),
            timestamp,
            fields,
        }
    }

    #[test]
    fn test_write_creates_series() -> Result<()> {
        let store = MetricStore::new("cpu.load", 100);

        store.write(&point("host=a", 100), 0)?;
        store.write(&point("host=b", 100), 0)?;
        store.write(&point("host=a", 200), 0)?;

        assert_eq!(store.tag_count(), 2);
        Ok(())
    }

    #[test]
    fn test_get_or_create_ts_store() -> Result<()> {
        let store = MetricStore::new("cpu.load", 2);

        store.get_or_create_ts_store("host=a")?;
        store.get_or_create_ts_store("host=a")?;
        store.get_or_create_ts_store("host=b")?;
        assert_eq!(store.tag_count(), 2);

        let result = store.get_or_create_ts_store("host=c");
        assert!(matches!(result, Err(Error::TooManyTags(_))));
        Ok(())
    }

    #[test]
    fn test_tag_limit_is_enforced() {
        let store = MetricStore::new("cpu.load", 10);

        for i in 0..10 {
            store
                .write(&point(&format!("host={i}"), 100), 0)
                .expect("under the limit");
        }
        let result = store.write(&point("host=overflow", 100), 0);
        assert!(matches!(result, Err(Error::TooManyTags(_))));
        assert_eq!(store.tag_count(), 10);

        // Existing tag-sets still accept writes.
        assert!(store.write(&point("host=3", 200), 0).is_ok());
    }

    #[test]
    fn test_limit_counts_frozen_maps() {
        let store = MetricStore::new("cpu.load", 3);

        store.write(&point("host=a", 100), 0).unwrap();
        store.write(&point("host=b", 100), 0).unwrap();
        store.freeze();

        store.write(&point("host=c", 100), 0).unwrap();
        let result = store.write(&point("host=d", 100), 0);
        assert!(matches!(result, Err(Error::TooManyTags(_))));
        assert_eq!(store.tag_count(), 3);
    }

    #[test]
    fn test_freeze_starts_fresh_mutable() {
        let store = MetricStore::new("cpu.load", 100);
        store.write(&point("host=a", 2100), 2).unwrap();

        store.freeze();

        let maps = store.maps().read().unwrap();
        assert!(maps.mutable.series.is_empty());
        assert_eq!(maps.immutable.len(), 1);
        assert_eq!(maps.immutable[0].series.len(), 1);
        assert!(maps.immutable[0].family_times.contains(&2));
    }

    #[test]
    fn test_family_times_union() {
        let store = MetricStore::new("cpu.load", 100);
        store.write(&point("host=a", 2100), 2).unwrap();
        store.freeze();
        store.write(&point("host=a", 4100), 4).unwrap();

        let mut times: Vec<_> = store.family_times().into_iter().collect();
        times.sort_unstable();
        assert_eq!(times, vec![2, 4]);
    }

    #[test]
    fn test_evictable_when_idle() {
        let store = MetricStore::new("cpu.load", 100);

        // Fresh store: empty mutable, no frozen maps.
        assert!(store.is_evictable(now_millis(), 60_000));

        store.write(&point("host=a", 100), 0).unwrap();
        assert!(!store.is_evictable(now_millis(), 60_000));

        store.freeze();
        // The frozen map is brand new, so the TTL has not elapsed.
        assert!(!store.is_evictable(now_millis(), 60_000));
        // With a zero TTL elapsed time wins.
        assert!(store.is_evictable(now_millis() + 1, 0));
    }
}
