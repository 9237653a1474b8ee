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

//! Test fixtures.
//!
//! Hand-rolled collaborator fakes with truthful concurrency semantics; the
//! mockall mocks generated from the collaborator traits cover expectation
//! style tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prometheus::Registry;
use tokio::sync::Notify;

use crate::config::DatabaseOptions;
use crate::error::{Result, UnexpectedSnafu};
use crate::index::{IndexDatabase, IndexDatabaseBuilder, IndexDatabaseRef, SeriesId};
use crate::kv::{
    Family, FamilyOptions, FamilyRef, Store, StoreManager, StoreManagerRef, StoreOptions, StoreRef,
};
use crate::metadata::{FieldId, FieldType, MetadataDatabase, MetadataRef, MetricId};
use crate::row::Tag;
use crate::shard::Database;

pub fn test_options(data_path: &Path, intervals: &[&str]) -> DatabaseOptions {
    DatabaseOptions {
        data_path: data_path.to_path_buf(),
        intervals: intervals.iter().map(|s| s.parse().unwrap()).collect(),
    }
}

/// In-memory metadata dictionary recording the order of field requests.
#[derive(Default)]
pub struct FakeMetadata {
    metric_ids: Mutex<HashMap<(String, String), MetricId>>,
    field_ids: Mutex<HashMap<(String, String, String, FieldType), FieldId>>,
    /// (field name, field type) in request order.
    pub field_requests: Mutex<Vec<(String, FieldType)>>,
    fail_metric: Option<String>,
    panic_metric: Option<String>,
}

impl FakeMetadata {
    pub fn new() -> FakeMetadata {
        FakeMetadata::default()
    }

    /// Fails `gen_metric_id` for the named metric.
    pub fn with_fail_metric(mut self, metric: impl Into<String>) -> FakeMetadata {
        self.fail_metric = Some(metric.into());
        self
    }

    /// Panics in `gen_metric_id` for the named metric.
    pub fn with_panic_metric(mut self, metric: impl Into<String>) -> FakeMetadata {
        self.panic_metric = Some(metric.into());
        self
    }
}

#[async_trait]
impl MetadataDatabase for FakeMetadata {
    async fn gen_metric_id(&self, namespace: &str, metric: &str) -> Result<MetricId> {
        if self.panic_metric.as_deref() == Some(metric) {
            panic!("metadata backend gone");
        }
        if self.fail_metric.as_deref() == Some(metric) {
            return UnexpectedSnafu {
                reason: format!("metric {metric} rejected"),
            }
            .fail();
        }
        let mut ids = self.metric_ids.lock().unwrap();
        let next = ids.len() as MetricId + 1;
        Ok(*ids
            .entry((namespace.to_string(), metric.to_string()))
            .or_insert(next))
    }

    async fn gen_field_id(
        &self,
        namespace: &str,
        metric: &str,
        field_name: &str,
        field_type: FieldType,
    ) -> Result<FieldId> {
        self.field_requests
            .lock()
            .unwrap()
            .push((field_name.to_string(), field_type));
        let mut ids = self.field_ids.lock().unwrap();
        let next = ids.len() as FieldId + 1;
        Ok(*ids
            .entry((
                namespace.to_string(),
                metric.to_string(),
                field_name.to_string(),
                field_type,
            ))
            .or_insert(next))
    }
}

/// In-memory series index with atomic created-vs-existing semantics.
#[derive(Default)]
pub struct FakeIndexDatabase {
    series: Mutex<HashMap<(MetricId, u64), SeriesId>>,
    next_series_id: AtomicU32,
    /// Number of inverted-index builds triggered.
    pub build_count: AtomicUsize,
    /// Number of flush bodies entered.
    pub flush_started: AtomicUsize,
    /// Number of flush bodies completed successfully.
    pub flush_count: AtomicUsize,
    /// Number of close calls.
    pub close_count: AtomicUsize,
    flush_block: Mutex<Option<Arc<Notify>>>,
    fail_flush: AtomicBool,
}

impl FakeIndexDatabase {
    pub fn new() -> FakeIndexDatabase {
        FakeIndexDatabase::default()
    }

    /// Makes subsequent flushes wait on `notify` before finishing.
    pub fn set_flush_block(&self, notify: Option<Arc<Notify>>) {
        *self.flush_block.lock().unwrap() = notify;
    }

    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexDatabase for FakeIndexDatabase {
    async fn get_or_create_series_id(
        &self,
        metric_id: MetricId,
        tags_hash: u64,
    ) -> Result<(SeriesId, bool)> {
        let mut series = self.series.lock().unwrap();
        if let Some(series_id) = series.get(&(metric_id, tags_hash)) {
            return Ok((*series_id, false));
        }
        let series_id = self.next_series_id.fetch_add(1, Ordering::SeqCst) + 1;
        series.insert((metric_id, tags_hash), series_id);
        Ok((series_id, true))
    }

    fn build_invert_index(
        &self,
        _namespace: &str,
        _metric: &str,
        _tags: &[Tag],
        _series_id: SeriesId,
    ) {
        self.build_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn flush(&self) -> Result<()> {
        self.flush_started.fetch_add(1, Ordering::SeqCst);
        let block = self.flush_block.lock().unwrap().clone();
        if let Some(notify) = block {
            notify.notified().await;
        }
        if self.fail_flush.load(Ordering::SeqCst) {
            return UnexpectedSnafu {
                reason: "index flush failed",
            }
            .fail();
        }
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builder handing out one prepared index database.
pub struct FakeIndexDatabaseBuilder {
    index_db: Option<Arc<FakeIndexDatabase>>,
}

impl FakeIndexDatabaseBuilder {
    pub fn new(index_db: Arc<FakeIndexDatabase>) -> FakeIndexDatabaseBuilder {
        FakeIndexDatabaseBuilder {
            index_db: Some(index_db),
        }
    }

    /// A builder that always fails.
    pub fn failing() -> FakeIndexDatabaseBuilder {
        FakeIndexDatabaseBuilder { index_db: None }
    }
}

#[async_trait]
impl IndexDatabaseBuilder for FakeIndexDatabaseBuilder {
    async fn build(
        &self,
        _meta_path: &Path,
        _metadata: MetadataRef,
        _forward_family: FamilyRef,
        _inverted_family: FamilyRef,
    ) -> Result<IndexDatabaseRef> {
        match &self.index_db {
            Some(index_db) => Ok(index_db.clone()),
            None => UnexpectedSnafu {
                reason: "index database unavailable",
            }
            .fail(),
        }
    }
}

pub struct NamedFamily {
    name: String,
}

impl Family for NamedFamily {
    fn name(&self) -> &str {
        &self.name
    }
}

struct RecordingStore {
    name: String,
    families: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Store for RecordingStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_family(&self, name: &str, _options: FamilyOptions) -> Result<FamilyRef> {
        self.families
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, name));
        Ok(Arc::new(NamedFamily {
            name: name.to_string(),
        }))
    }
}

/// Store manager recording every store and family touched.
#[derive(Default)]
pub struct RecordingStoreManager {
    /// Store names created, in order.
    pub created: Mutex<Vec<String>>,
    /// Store names closed, in order.
    pub closed: Mutex<Vec<String>>,
    /// `store:family` pairs created, in order.
    pub created_families: Arc<Mutex<Vec<String>>>,
    fail_create_containing: Option<String>,
}

impl RecordingStoreManager {
    pub fn new() -> RecordingStoreManager {
        RecordingStoreManager::default()
    }

    /// Fails `create_store` for any name containing `pattern`.
    pub fn with_fail_create_containing(
        mut self,
        pattern: impl Into<String>,
    ) -> RecordingStoreManager {
        self.fail_create_containing = Some(pattern.into());
        self
    }
}

#[async_trait]
impl StoreManager for RecordingStoreManager {
    async fn create_store(&self, name: &str, _options: StoreOptions) -> Result<StoreRef> {
        if let Some(pattern) = &self.fail_create_containing {
            if name.contains(pattern.as_str()) {
                return UnexpectedSnafu {
                    reason: format!("store {name} rejected"),
                }
                .fail();
            }
        }
        self.created.lock().unwrap().push(name.to_string());
        Ok(Arc::new(RecordingStore {
            name: name.to_string(),
            families: self.created_families.clone(),
        }))
    }

    async fn close_store(&self, name: &str) -> Result<()> {
        self.closed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// Database handle wiring the fakes together.
pub struct FakeDatabase {
    name: String,
    options: DatabaseOptions,
    metadata: MetadataRef,
    store_manager: StoreManagerRef,
    registry: Registry,
}

impl FakeDatabase {
    pub fn new(
        name: impl Into<String>,
        options: DatabaseOptions,
        metadata: MetadataRef,
        store_manager: StoreManagerRef,
    ) -> FakeDatabase {
        FakeDatabase {
            name: name.into(),
            options,
            metadata,
            store_manager,
            registry: Registry::new(),
        }
    }
}

impl Database for FakeDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> DatabaseOptions {
        self.options.clone()
    }

    fn metadata(&self) -> MetadataRef {
        self.metadata.clone()
    }

    fn store_manager(&self) -> StoreManagerRef {
        self.store_manager.clone()
    }

    fn metric_registry(&self) -> Registry {
        self.registry.clone()
    }
}
