use std::path::PathBuf;
use std::time::Duration;

use crate::errinput;
use crate::error::Result;

/// Configuration for the in-memory write path.
#[derive(Debug, Clone)]
pub struct MemDbConfig {
    /// Number of shards the metric-store map is split into. Must be a power
    /// of two (default: 32).
    pub shards: usize,

    /// Idle TTL before a metric store becomes evictable (default: 60s).
    pub tags_id_ttl: Duration,

    /// Global cap on distinct tag-sets per metric (default: 100000).
    /// Per-metric overrides arrive through the limit channel.
    pub max_tags_per_metric: u32,

    /// Width of a family-time bucket (default: 1 day).
    pub family_interval: Duration,

    /// How often the id-sync task pre-assigns ids for newly seen
    /// names/tags/fields (default: 30s).
    pub id_sync_interval: Duration,
}

impl Default for MemDbConfig {
    fn default() -> Self {
        Self {
            shards: 32,
            tags_id_ttl: Duration::from_secs(60),
            max_tags_per_metric: 100_000,
            family_interval: Duration::from_secs(24 * 60 * 60),
            id_sync_interval: Duration::from_secs(30),
        }
    }
}

impl MemDbConfig {
    /// Set the shard count.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the idle TTL before a metric store becomes evictable.
    pub fn tags_id_ttl(mut self, ttl: Duration) -> Self {
        self.tags_id_ttl = ttl;
        self
    }

    /// Set the global tag-set cardinality cap.
    pub fn max_tags_per_metric(mut self, max: u32) -> Self {
        self.max_tags_per_metric = max;
        self
    }

    /// Set the family-time bucket width.
    pub fn family_interval(mut self, interval: Duration) -> Self {
        self.family_interval = interval;
        self
    }

    /// Set the id-sync task interval.
    pub fn id_sync_interval(mut self, interval: Duration) -> Self {
        self.id_sync_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 || !self.shards.is_power_of_two() {
            return errinput!("shard count must be a power of two, got {}", self.shards);
        }
        if self.family_interval.is_zero() {
            return errinput!("family interval must be non-zero");
        }
        Ok(())
    }
}

/// Configuration for a kv store's version set.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding CURRENT, manifests and table files.
    pub dir: PathBuf,

    /// Level count of each family version (default: 7).
    pub num_of_levels: usize,
}

impl StoreConfig {
    /// Create a new config rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            num_of_levels: 7,
        }
    }

    /// Set the level count.
    pub fn num_of_levels(mut self, levels: usize) -> Self {
        self.num_of_levels = levels;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_of_levels == 0 {
            return errinput!("store needs at least one level");
        }
        Ok(())
    }
}
