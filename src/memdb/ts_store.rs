//! Per-tag-set time-series storage.

use std::collections::HashMap;

use crate::memdb::field_store::FieldStore;
use crate::point::{FieldKind, FieldValue};

/// One time series: the field stores of a single (metric, tag-set) pair.
#[derive(Debug, Clone, Default)]
pub struct TsStore {
    fields: HashMap<String, FieldStore>,
}

impl TsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes each field value to its field store, creating stores on first
    /// write. A value whose kind conflicts with the registered one is
    /// dropped (that field only); the rest of the point proceeds.
    pub fn write(&mut self, timestamp: i64, fields: &HashMap<String, FieldValue>) {
        for (name, value) in fields {
            let store = self
                .fields
                .entry(name.clone())
                .or_insert_with(|| FieldStore::new(value.kind()));
            if store.kind() != value.kind() {
                tracing::warn!(
                    field = name.as_str(),
                    expected = ?store.kind(),
                    got = ?value.kind(),
                    "dropping field value with mismatched kind"
                );
                continue;
            }
            store.write(timestamp, value);
        }
    }

    pub fn get_or_create_fstore(&mut self, name: &str, kind: FieldKind) -> &mut FieldStore {
        self.fields
            .entry(name.to_string())
            .or_insert_with(|| FieldStore::new(kind))
    }

    pub fn fields(&self) -> &HashMap<String, FieldStore> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut HashMap<String, FieldStore> {
        &mut self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(FieldStore::is_empty)
    }
}
