//! Id assignment for metric names, tag-sets, and fields.
//!
//! Ids are minted on first sight and must survive restarts, so every new
//! mapping is appended to a CRC-framed journal (bincode records inside
//! [`crate::encoding`] frames) and synced before the id is handed out.
//! Opening the journal replays it to rebuild the maps and the per-namespace
//! counters.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::encoding::{FrameReader, FrameWriter};
use crate::error::Result;
use crate::point::FieldKind;
use crate::Error;

/// Assigns stable ids in three namespaces: metric ids, tag-set ids scoped by
/// metric, and field ids scoped by metric.
pub trait IdGenerator: Send + Sync {
    fn gen_metric_id(&self, name: &str) -> Result<i32>;
    fn gen_tag_id(&self, metric_id: i32, tag_set: &str) -> Result<i64>;
    fn gen_field_id(&self, metric_id: i32, field_name: &str, kind: FieldKind) -> Result<i16>;
}

#[derive(Debug, Serialize, Deserialize)]
enum MetaRecord {
    Metric {
        name: String,
        id: i32,
    },
    Tag {
        metric_id: i32,
        tag_set: String,
        id: i64,
    },
    Field {
        metric_id: i32,
        name: String,
        kind: FieldKind,
        id: i16,
    },
}

struct MetaState {
    metrics: HashMap<String, i32>,
    tags: HashMap<(i32, String), i64>,
    fields: HashMap<(i32, String), (i16, FieldKind)>,
    next_metric_id: i32,
    next_tag_ids: HashMap<i32, i64>,
    next_field_ids: HashMap<i32, i16>,
    journal: FrameWriter,
}

impl MetaState {
    fn record(&mut self, record: &MetaRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        self.journal.append(&payload)?;
        self.journal.sync()
    }
}

/// File-backed [`IdGenerator`].
pub struct MetaStore {
    state: Mutex<MetaState>,
}

impl MetaStore {
    /// Opens the id journal at `path`, replaying any existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut metrics = HashMap::new();
        let mut tags = HashMap::new();
        let mut fields = HashMap::new();
        let mut next_metric_id = 1;
        let mut next_tag_ids: HashMap<i32, i64> = HashMap::new();
        let mut next_field_ids: HashMap<i32, i16> = HashMap::new();

        if path.exists() {
            for frame in FrameReader::open(path)? {
                let record: MetaRecord = bincode::deserialize(&frame?)?;
                match record {
                    MetaRecord::Metric { name, id } => {
                        next_metric_id = next_metric_id.max(id + 1);
                        metrics.insert(name, id);
                    }
                    MetaRecord::Tag {
                        metric_id,
                        tag_set,
                        id,
                    } => {
                        let next = next_tag_ids.entry(metric_id).or_insert(1);
                        *next = (*next).max(id + 1);
                        tags.insert((metric_id, tag_set), id);
                    }
                    MetaRecord::Field {
                        metric_id,
                        name,
                        kind,
                        id,
                    } => {
                        let next = next_field_ids.entry(metric_id).or_insert(1);
                        *next = (*next).max(id + 1);
                        fields.insert((metric_id, name), (id, kind));
                    }
                }
            }
        }

        let journal = FrameWriter::append_to(path)?;
        Ok(Self {
            state: Mutex::new(MetaState {
                metrics,
                tags,
                fields,
                next_metric_id,
                next_tag_ids,
                next_field_ids,
                journal,
            }),
        })
    }
}

impl IdGenerator for MetaStore {
    fn gen_metric_id(&self, name: &str) -> Result<i32> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.metrics.get(name) {
            return Ok(*id);
        }

        let id = state.next_metric_id;
        state.record(&MetaRecord::Metric {
            name: name.to_string(),
            id,
        })?;
        state.next_metric_id += 1;
        state.metrics.insert(name.to_string(), id);
        Ok(id)
    }

    fn gen_tag_id(&self, metric_id: i32, tag_set: &str) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.tags.get(&(metric_id, tag_set.to_string())) {
            return Ok(*id);
        }

        let id = *state.next_tag_ids.entry(metric_id).or_insert(1);
        state.record(&MetaRecord::Tag {
            metric_id,
            tag_set: tag_set.to_string(),
            id,
        })?;
        state.next_tag_ids.insert(metric_id, id + 1);
        state.tags.insert((metric_id, tag_set.to_string()), id);
        Ok(id)
    }

    fn gen_field_id(&self, metric_id: i32, field_name: &str, kind: FieldKind) -> Result<i16> {
        let mut state = self.state.lock().unwrap();
        if let Some((id, recorded_kind)) = state.fields.get(&(metric_id, field_name.to_string())) {
            if *recorded_kind != kind {
                return Err(Error::FieldKindMismatch(field_name.to_string()));
            }
            return Ok(*id);
        }

        let id = *state.next_field_ids.entry(metric_id).or_insert(1);
        state.record(&MetaRecord::Field {
            metric_id,
            name: field_name.to_string(),
            kind,
            id,
        })?;
        state.next_field_ids.insert(metric_id, id + 1);
        state
            .fields
            .insert((metric_id, field_name.to_string()), (id, kind));
        Ok(id)
    }
}
