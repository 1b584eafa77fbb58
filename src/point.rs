//! Measurement points and field values.
//!
//! A point carries one measurement for one metric: a canonical tag-set
//! string, a millisecond timestamp, and one or more named field values.
//! Field values are a closed set of kinds; merging two values of the same
//! kind is a switch on the tag.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::Error;

/// The kind of a field, fixed at first write and checked on every
/// subsequent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Sum,
    Min,
    Max,
    Last,
    Histogram,
    Compound,
}

/// Pre-aggregated summary carried by a compound field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

/// A single field value, merged on write by kind-specific semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Sum(f64),
    Min(f64),
    Max(f64),
    Last(f64),
    /// Bucket upper bound -> count.
    Histogram(BTreeMap<u64, u64>),
    Compound(Summary),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Sum(_) => FieldKind::Sum,
            FieldValue::Min(_) => FieldKind::Min,
            FieldValue::Max(_) => FieldKind::Max,
            FieldValue::Last(_) => FieldKind::Last,
            FieldValue::Histogram(_) => FieldKind::Histogram,
            FieldValue::Compound(_) => FieldKind::Compound,
        }
    }

    /// Merges `other` into `self`. Both values must share a kind; the field
    /// store checks that before calling.
    pub(crate) fn merge(&mut self, other: &FieldValue) {
        match (self, other) {
            (FieldValue::Sum(a), FieldValue::Sum(b)) => *a += b,
            (FieldValue::Min(a), FieldValue::Min(b)) => {
                if *b < *a {
                    *a = *b;
                }
            }
            (FieldValue::Max(a), FieldValue::Max(b)) => {
                if *b > *a {
                    *a = *b;
                }
            }
            (FieldValue::Last(a), FieldValue::Last(b)) => *a = *b,
            (FieldValue::Histogram(a), FieldValue::Histogram(b)) => {
                for (bucket, count) in b {
                    *a.entry(*bucket).or_insert(0) += count;
                }
            }
            (FieldValue::Compound(a), FieldValue::Compound(b)) => {
                a.count += b.count;
                a.sum += b.sum;
                a.min = a.min.min(b.min);
                a.max = a.max.max(b.max);
            }
            _ => debug_assert!(false, "merge called with mismatched field kinds"),
        }
    }
}

/// One measurement for one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Metric name.
    pub name: String,
    /// Canonical tag-set string, e.g. `"host=alpha,region=west"`.
    pub tags: String,
    /// Timestamp in milliseconds.
    pub timestamp: i64,
    /// Field name -> value.
    pub fields: HashMap<String, FieldValue>,
}

impl Point {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidPoint("empty metric name".to_string()));
        }
        if self.fields.is_empty() {
            return Err(Error::InvalidPoint("no fields".to_string()));
        }
        Ok(())
    }

    /// The family-time bucket this point falls into.
    pub fn family_time(&self, interval_ms: i64) -> i64 {
        self.timestamp / interval_ms
    }
}
