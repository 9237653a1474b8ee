// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Raw write rows.
//!
//! A [`StorageRow`] is one un-resolved data point handed in by the ingestion
//! layer. Metadata resolution annotates it in place with a metric ID, a
//! series ID and an ordered field-ID list, then marks it writable; the
//! storage write path only accepts writable rows.

use smallvec::SmallVec;
use xxhash_rust::xxh3::Xxh3;

use crate::index::SeriesId;
use crate::metadata::{FieldId, FieldType, MetricId};
use crate::timeutil::Timestamp;

/// Field name the histogram minimum registers under.
pub const HISTOGRAM_MIN_FIELD_NAME: &str = "HistogramMin";
/// Field name the histogram maximum registers under.
pub const HISTOGRAM_MAX_FIELD_NAME: &str = "HistogramMax";
/// Field name the histogram sum registers under.
pub const HISTOGRAM_SUM_FIELD_NAME: &str = "HistogramSum";
/// Field name the histogram count registers under.
pub const HISTOGRAM_COUNT_FIELD_NAME: &str = "HistogramCount";

/// Field name of one explicit histogram bucket.
pub fn histogram_bucket_name(upper_bound: f64) -> String {
    format!("__bucket_{upper_bound}")
}

/// One tag key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Tag {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A plain field carrying a single value.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleField {
    pub name: String,
    pub field_type: FieldType,
    pub value: f64,
}

/// A pre-aggregated histogram field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompoundField {
    pub count: f64,
    pub sum: f64,
    /// Zero means the writer observed no minimum worth materializing.
    pub min: f64,
    /// Zero means the writer observed no maximum worth materializing.
    pub max: f64,
    pub explicit_bounds: Vec<f64>,
    pub values: Vec<f64>,
}

/// One raw write record.
#[derive(Debug, Clone)]
pub struct StorageRow {
    namespace: Option<String>,
    name: String,
    timestamp: Timestamp,
    tags: Vec<Tag>,
    simple_fields: Vec<SimpleField>,
    compound_field: Option<CompoundField>,

    /// Resolved metric ID.
    pub metric_id: MetricId,
    /// Resolved series ID.
    pub series_id: SeriesId,
    /// Resolved field IDs, in resolution order.
    pub field_ids: SmallVec<[FieldId; 8]>,
    writable: bool,
}

impl StorageRow {
    pub fn new(name: impl Into<String>, timestamp: Timestamp) -> StorageRow {
        StorageRow {
            namespace: None,
            name: name.into(),
            timestamp,
            tags: Vec::new(),
            simple_fields: Vec::new(),
            compound_field: None,
            metric_id: 0,
            series_id: 0,
            field_ids: SmallVec::new(),
            writable: false,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> StorageRow {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> StorageRow {
        self.tags.push(Tag::new(key, value));
        self
    }

    pub fn with_simple_field(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        value: f64,
    ) -> StorageRow {
        self.simple_fields.push(SimpleField {
            name: name.into(),
            field_type,
            value,
        });
        self
    }

    pub fn with_compound_field(mut self, field: CompoundField) -> StorageRow {
        self.compound_field = Some(field);
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn simple_fields(&self) -> &[SimpleField] {
        &self.simple_fields
    }

    pub fn compound_field(&self) -> Option<&CompoundField> {
        self.compound_field.as_ref()
    }

    /// Stable hash of the tag set.
    ///
    /// Insensitive to tag insertion order; keys the series dictionary and the
    /// on-disk index, so it must not change across processes or releases.
    pub fn tags_hash(&self) -> u64 {
        let mut sorted: Vec<&Tag> = self.tags.iter().collect();
        sorted.sort_unstable();

        let mut hasher = Xxh3::new();
        for tag in sorted {
            hasher.update(tag.key.as_bytes());
            hasher.update(&[0xfe]);
            hasher.update(tag.value.as_bytes());
            hasher.update(&[0xff]);
        }
        hasher.digest()
    }

    /// Whether metadata resolution completed and the row may be written.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors() {
        let row = StorageRow::new("cpu", 1000)
            .with_namespace("system")
            .with_tag("host", "a")
            .with_simple_field("usage", FieldType::Sum, 1.5);

        assert_eq!(row.namespace(), Some("system"));
        assert_eq!(row.name(), "cpu");
        assert_eq!(row.timestamp(), 1000);
        assert_eq!(row.tags().len(), 1);
        assert_eq!(row.simple_fields().len(), 1);
        assert!(row.compound_field().is_none());
        assert!(!row.is_writable());
    }

    #[test]
    fn test_tags_hash_insertion_order_insensitive() {
        let a = StorageRow::new("cpu", 0)
            .with_tag("host", "a")
            .with_tag("zone", "b");
        let b = StorageRow::new("cpu", 0)
            .with_tag("zone", "b")
            .with_tag("host", "a");
        assert_eq!(a.tags_hash(), b.tags_hash());
    }

    #[test]
    fn test_tags_hash_distinguishes_tag_sets() {
        let a = StorageRow::new("cpu", 0).with_tag("host", "a");
        let b = StorageRow::new("cpu", 0).with_tag("host", "b");
        let c = StorageRow::new("cpu", 0);
        assert_ne!(a.tags_hash(), b.tags_hash());
        assert_ne!(a.tags_hash(), c.tags_hash());
        // Key/value boundaries matter.
        let d = StorageRow::new("cpu", 0).with_tag("hosta", "");
        assert_ne!(a.tags_hash(), d.tags_hash());
    }

    #[test]
    fn test_histogram_bucket_name() {
        assert_eq!(histogram_bucket_name(1.0), "__bucket_1");
        assert_eq!(histogram_bucket_name(2.5), "__bucket_2.5");
    }
}
