//! Per-field slot storage.

use std::collections::BTreeMap;

use crate::point::{FieldKind, FieldValue};

/// Holds one field's values for one time series, keyed by timestamp.
/// Values landing on an existing slot are merged by the field's kind.
#[derive(Debug, Clone)]
pub struct FieldStore {
    kind: FieldKind,
    slots: BTreeMap<i64, FieldValue>,
}

impl FieldStore {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            slots: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Merges `value` into the slot at `timestamp`. The caller checks the
    /// kind before writing.
    pub fn write(&mut self, timestamp: i64, value: &FieldValue) {
        debug_assert_eq!(self.kind, value.kind());
        match self.slots.get_mut(&timestamp) {
            Some(slot) => slot.merge(value),
            None => {
                self.slots.insert(timestamp, value.clone());
            }
        }
    }

    pub fn value_at(&self, timestamp: i64) -> Option<&FieldValue> {
        self.slots.get(&timestamp)
    }

    /// The slots falling into the given family bucket, in timestamp order.
    pub fn family_slots(&self, family_time: i64, interval_ms: i64) -> Vec<(i64, FieldValue)> {
        let start = family_time * interval_ms;
        self.slots
            .range(start..start + interval_ms)
            .map(|(ts, value)| (*ts, value.clone()))
            .collect()
    }

    /// Removes the given family bucket's slots.
    pub fn evict_family(&mut self, family_time: i64, interval_ms: i64) {
        let start = family_time * interval_ms;
        let mut bucket = self.slots.split_off(&start);
        let keep = bucket.split_off(&(start + interval_ms));
        self.slots.extend(keep);
    }
}
