//! The sharded in-memory write front-end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use itertools::Itertools;
use tokio::sync::mpsc;

use crate::config::MemDbConfig;
use crate::errinput;
use crate::error::Result;
use crate::hashers::fnv1a32;
use crate::kv::version::FileMeta;
use crate::memdb::flush;
use crate::memdb::id_generator::IdGenerator;
use crate::memdb::metric_store::MetricStore;
use crate::memdb::now_millis;
use crate::point::Point;
use crate::scheduler::{BackgroundTask, Scheduler};
use crate::table::TableWriter;
use crate::Error;

/// A mutable map younger than this cannot be frozen by
/// [`MemoryDatabase::reset_metric_store`].
const FREEZE_AGE_MS: i64 = 60 * 60 * 1000;

type Shard = RwLock<HashMap<u32, Arc<MetricStore>>>;
type LimitUpdate = Option<HashMap<String, u32>>;

/// The write path of a storage node: a sharded set of metric stores plus the
/// background tasks that keep them bounded (evictor, limit updater,
/// id syncer).
///
/// Created inside a tokio runtime; [`MemoryDatabase::close`] stops the
/// background tasks.
pub struct MemoryDatabase {
    config: MemDbConfig,
    interval_ms: i64,
    shard_mask: u32,
    shards: Vec<Shard>,
    generator: Arc<dyn IdGenerator>,
    limit_overrides: RwLock<HashMap<String, u32>>,
    evict_tx: mpsc::Sender<()>,
    scheduler: Scheduler,
    closed: AtomicBool,
}

impl MemoryDatabase {
    pub fn new(config: MemDbConfig, generator: Arc<dyn IdGenerator>) -> Result<Arc<Self>> {
        config.validate()?;

        let interval_ms = config.family_interval.as_millis() as i64;
        let shards: Vec<Shard> = (0..config.shards)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        let (evict_tx, evict_rx) = mpsc::channel(1);

        let db = Arc::new(Self {
            shard_mask: (config.shards - 1) as u32,
            interval_ms,
            shards,
            generator,
            limit_overrides: RwLock::new(HashMap::new()),
            evict_tx,
            scheduler: Scheduler::new(),
            closed: AtomicBool::new(false),
            config,
        });

        db.start_evictor(evict_rx);
        db.scheduler.register(Arc::new(IdSyncTask { db: db.clone() }));
        Ok(db)
    }

    /// Writes one point. Fails with `InvalidPoint` on validation,
    /// `TooManyTags` on a cardinality breach (which also nudges the
    /// evictor), `Cancelled` after close.
    pub fn write(&self, point: &Point) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        point.validate()?;

        let family_time = point.family_time(self.interval_ms);
        let store = self.get_or_create_mstore(&point.name);
        match store.write(point, family_time) {
            Err(err @ Error::TooManyTags(_)) => {
                self.notify_evictor();
                Err(err)
            }
            other => other,
        }
    }

    /// Registers a listener for per-metric tag-limit updates. `Some(map)`
    /// overrides limits for the mentioned metrics only; `None` is a no-op
    /// heartbeat. Closing the sender terminates the listener task.
    pub fn with_max_tags_limit(self: &Arc<Self>, mut rx: mpsc::Receiver<LimitUpdate>) {
        let db = self.clone();
        let mut shutdown = self.scheduler.subscribe();
        self.scheduler.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    update = rx.recv() => match update {
                        Some(Some(limits)) => db.set_limits(limits),
                        Some(None) => {}
                        None => break,
                    }
                }
            }
        });
    }

    fn set_limits(&self, limits: HashMap<String, u32>) {
        // Remember the overrides for stores created later. Released before
        // touching the shards; shard locks take the override lock.
        {
            let mut overrides = self.limit_overrides.write().unwrap();
            for (metric, limit) in &limits {
                overrides.insert(metric.clone(), *limit);
            }
        }
        for (metric, limit) in limits {
            if let Some(store) = self.get_mstore(&metric) {
                store.set_max_tags_limit(limit);
            }
        }
    }

    /// Freezes the metric's mutable map if it is at least one freeze
    /// interval old; otherwise fails with `TooRecent`.
    pub fn reset_metric_store(&self, metric: &str) -> Result<()> {
        let store = match self.get_mstore(metric) {
            Some(store) => store,
            None => return errinput!("unknown metric: {metric}"),
        };

        if now_millis() - store.mutable_version() < FREEZE_AGE_MS {
            return Err(Error::TooRecent);
        }
        store.freeze();
        Ok(())
    }

    pub fn count_metrics(&self) -> usize {
        self.shards.iter().map(|s| s.read().unwrap().len()).sum()
    }

    /// Distinct tag-sets of the metric, or -1 if it is unknown.
    pub fn count_tags(&self, metric: &str) -> i64 {
        match self.get_mstore(metric) {
            Some(store) => store.tag_count() as i64,
            None => -1,
        }
    }

    /// Sorted set of family-time buckets currently held.
    pub fn families(&self) -> Vec<i64> {
        let times: HashSet<i64> = self
            .all_stores()
            .iter()
            .flat_map(|store| store.family_times())
            .collect();
        times.into_iter().sorted().collect()
    }

    /// Flushes one family to the table writer. Returns the new file's
    /// metadata, or `None` when no store held data for the family. See
    /// [`flush::flush_family_to`].
    pub async fn flush_family_to(
        &self,
        family_time: i64,
        writer: &mut dyn TableWriter,
    ) -> Result<Option<FileMeta>> {
        flush::flush_family_to(self, family_time, writer).await
    }

    /// Pre-assigns ids for every name, tag-set, and field currently in
    /// memory so the flush path finds them already minted. A field whose
    /// kind conflicts with the registered one is skipped.
    pub fn sync_ids(&self) -> Result<()> {
        for store in self.all_stores() {
            let metric_id = self.generator.gen_metric_id(store.name())?;
            let maps = store.maps().read().unwrap();
            for map in std::iter::once(&maps.mutable).chain(maps.immutable.iter()) {
                for (tags, ts_store) in &map.series {
                    self.generator.gen_tag_id(metric_id, tags)?;
                    for (field_name, field_store) in ts_store.fields() {
                        match self.generator.gen_field_id(
                            metric_id,
                            field_name,
                            field_store.kind(),
                        ) {
                            Err(Error::FieldKindMismatch(field)) => {
                                tracing::warn!(
                                    metric = store.name(),
                                    field = field.as_str(),
                                    "field registered with a different kind, skipping"
                                );
                            }
                            other => {
                                other?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Stops all background tasks. Blocking operations issued afterwards
    /// fail with `Cancelled`.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.scheduler.shutdown().await
    }

    /// Nudges the evictor. Non-blocking: if a pass is already pending the
    /// signal coalesces with it.
    pub fn notify_evictor(&self) {
        let _ = self.evict_tx.try_send(());
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    pub(crate) fn generator(&self) -> &Arc<dyn IdGenerator> {
        &self.generator
    }

    pub(crate) fn get_or_create_mstore(&self, metric: &str) -> Arc<MetricStore> {
        let hash = fnv1a32(metric.as_bytes());
        let shard = &self.shards[(hash & self.shard_mask) as usize];

        if let Some(store) = shard.read().unwrap().get(&hash) {
            return store.clone();
        }

        let mut stores = shard.write().unwrap();
        stores
            .entry(hash)
            .or_insert_with(|| {
                let limit = self
                    .limit_overrides
                    .read()
                    .unwrap()
                    .get(metric)
                    .copied()
                    .unwrap_or(self.config.max_tags_per_metric);
                Arc::new(MetricStore::new(metric, limit))
            })
            .clone()
    }

    fn get_mstore(&self, metric: &str) -> Option<Arc<MetricStore>> {
        let hash = fnv1a32(metric.as_bytes());
        let shard = &self.shards[(hash & self.shard_mask) as usize];
        shard.read().unwrap().get(&hash).cloned()
    }

    pub(crate) fn all_stores(&self) -> Vec<Arc<MetricStore>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().unwrap().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn start_evictor(self: &Arc<Self>, mut rx: mpsc::Receiver<()>) {
        let db = self.clone();
        let mut shutdown = self.scheduler.subscribe();
        self.scheduler.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    signal = rx.recv() => match signal {
                        Some(()) => db.evict_pass(),
                        None => break,
                    }
                }
            }
        });
    }

    fn evict_pass(&self) {
        let now = now_millis();
        let ttl = self.config.tags_id_ttl.as_millis() as i64;
        let mut evicted = 0usize;

        for shard in &self.shards {
            let candidates: Vec<u32> = shard
                .read()
                .unwrap()
                .iter()
                .filter(|(_, store)| store.is_evictable(now, ttl))
                .map(|(hash, _)| *hash)
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let mut stores = shard.write().unwrap();
            for hash in candidates {
                // Re-check under the write lock; a write may have landed.
                let still_evictable = stores
                    .get(&hash)
                    .map(|store| store.is_evictable(now, ttl))
                    .unwrap_or(false);
                if still_evictable {
                    stores.remove(&hash);
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, "evicted idle metric stores");
        }
    }

    #[cfg(test)]
    pub(crate) fn evict_pass_for_test(&self) {
        self.evict_pass()
    }
}

struct IdSyncTask {
    db: Arc<MemoryDatabase>,
}

#[async_trait::async_trait]
impl BackgroundTask for IdSyncTask {
    fn name(&self) -> &'static str {
        "id-sync"
    }

    fn interval(&self) -> Duration {
        self.db.config.id_sync_interval
    }

    async fn execute(&self) -> Result<()> {
        self.db.sync_ids()
    }
}
