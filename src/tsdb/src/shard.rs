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

//! One horizontal partition of a database.
//!
//! A [`Shard`] routes writes into the data family of the canonical write
//! interval while pre-creating the matching family of every rollup interval,
//! resolves raw rows into metric/series/field IDs against the metadata
//! dictionary and the series index, and serializes flushes of its index
//! database.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use prometheus::Registry;
use smallvec::SmallVec;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{error, info};

use crate::buffer::{BufferManagerRef, FsBufferManager};
use crate::config::DatabaseOptions;
use crate::error::{CreateDirSnafu, EmptyIntervalsSnafu, Result, UnexpectedSnafu};
use crate::flush::FlushGate;
use crate::index::{
    IndexDatabaseBuilderRef, IndexDatabaseRef, FORWARD_INDEX_FAMILY, INVERTED_INDEX_FAMILY,
    SERIES_FORWARD_MERGER, SERIES_ID_WITHOUT_TAGS, SERIES_INVERTED_MERGER,
};
use crate::kv::{FamilyOptions, StoreManagerRef, StoreOptions, StoreRef};
use crate::metadata::{FieldId, FieldType, MetadataRef, DEFAULT_NAMESPACE};
use crate::metrics::ShardMetrics;
use crate::row::{
    histogram_bucket_name, StorageRow, HISTOGRAM_COUNT_FIELD_NAME, HISTOGRAM_MAX_FIELD_NAME,
    HISTOGRAM_MIN_FIELD_NAME, HISTOGRAM_SUM_FIELD_NAME,
};
use crate::segment::{DataFamilyRef, IntervalSegment, IntervalSegmentRef};
use crate::timeutil::{Interval, IntervalType, TimeRange, Timestamp};

/// Identifier of one shard within its database.
pub type ShardId = u32;

const SEGMENT_DIR: &str = "segment";
const BUFFER_DIR: &str = "buffer";
const META_DIR: &str = "meta";
const INDEX_DIR: &str = "index";

/// Handle to the database owning a shard.
///
/// A back-reference only: the database outlives its shards and the shard
/// never closes resources reached through it, except the stores it created
/// itself.
#[mockall::automock]
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    fn options(&self) -> DatabaseOptions;

    /// Database-wide metadata dictionary.
    fn metadata(&self) -> MetadataRef;

    /// Manager the shard creates its stores through.
    fn store_manager(&self) -> StoreManagerRef;

    /// Registry shard metrics register into.
    fn metric_registry(&self) -> Registry;
}

pub type DatabaseRef = Arc<dyn Database>;

fn shard_indicator(db: &str, shard_id: ShardId) -> String {
    format!("{db}/{shard_id}")
}

fn shard_path(data_path: &Path, db: &str, shard_id: ShardId) -> PathBuf {
    data_path.join(db).join(shard_id.to_string())
}

fn shard_index_indicator(db: &str, shard_id: ShardId) -> String {
    format!("{}/{INDEX_DIR}", shard_indicator(db, shard_id))
}

/// Builder constructing a [`Shard`].
///
/// Construction opens on-disk structures for every configured interval and
/// initializes the index database; any failure closes whatever was already
/// opened and aborts with the original error.
pub struct ShardOpener {
    db: DatabaseRef,
    shard_id: ShardId,
    index_db_builder: IndexDatabaseBuilderRef,
    buffer_manager: Option<BufferManagerRef>,
}

impl ShardOpener {
    pub fn new(
        db: DatabaseRef,
        shard_id: ShardId,
        index_db_builder: IndexDatabaseBuilderRef,
    ) -> ShardOpener {
        ShardOpener {
            db,
            shard_id,
            index_db_builder,
            buffer_manager: None,
        }
    }

    /// Overrides the filesystem-backed buffer manager.
    pub fn buffer_manager(mut self, buffer_manager: BufferManagerRef) -> ShardOpener {
        self.buffer_manager = Some(buffer_manager);
        self
    }

    pub async fn open(self) -> Result<ShardRef> {
        let options = self.db.options();
        let intervals = options.sorted_intervals();
        ensure!(!intervals.is_empty(), EmptyIntervalsSnafu);
        // The smallest interval is the canonical write target.
        let write_interval = intervals[0];

        let path = shard_path(&options.data_path, self.db.name(), self.shard_id);
        std::fs::create_dir_all(&path).context(CreateDirSnafu {
            path: path.display().to_string(),
        })?;

        let buffer_manager = self
            .buffer_manager
            .clone()
            .unwrap_or_else(|| Arc::new(FsBufferManager::new(path.join(BUFFER_DIR))));
        // Discard buffers a prior unclean shutdown left behind.
        buffer_manager.cleanup();

        let metrics = ShardMetrics::new(&self.db.metric_registry(), self.db.name(), self.shard_id)?;
        let store_manager = self.db.store_manager();
        let indicator = shard_indicator(self.db.name(), self.shard_id);

        let mut rollup_targets: BTreeMap<Interval, IntervalSegmentRef> = BTreeMap::new();
        for interval in intervals {
            let segment_dir = path.join(SEGMENT_DIR).join(interval.to_string());
            let store_prefix = format!("{indicator}/{SEGMENT_DIR}/{interval}");
            match IntervalSegment::open(interval, segment_dir, store_prefix, store_manager.clone())
                .await
            {
                Ok(segment) => {
                    rollup_targets.insert(interval, segment);
                }
                Err(e) => {
                    error!(
                        db = %self.db.name(),
                        shard = self.shard_id,
                        interval = %interval,
                        error = %e,
                        "Failed to open interval segment, closing partially constructed shard"
                    );
                    close_hierarchies(&rollup_targets).await;
                    return Err(e);
                }
            }
        }
        let segment = rollup_targets
            .get(&write_interval)
            .cloned()
            .context(UnexpectedSnafu {
                reason: "write interval hierarchy missing",
            })?;

        let (index_store, index_db) = match self.init_index_database(&path, &store_manager).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(
                    db = %self.db.name(),
                    shard = self.shard_id,
                    error = %e,
                    "Failed to initialize index database, closing partially constructed shard"
                );
                close_hierarchies(&rollup_targets).await;
                return Err(e);
            }
        };

        info!(shard = %indicator, interval = %write_interval, "Opened shard");
        let metadata = self.db.metadata();
        Ok(Arc::new(Shard {
            db: self.db,
            id: self.shard_id,
            indicator,
            metadata,
            store_manager,
            buffer_manager,
            interval: write_interval,
            segment,
            rollup_targets,
            index_store,
            index_db,
            flush_gate: FlushGate::new(),
            metrics,
            closed: AtomicBool::new(false),
        }))
    }

    async fn init_index_database(
        &self,
        shard_path: &Path,
        store_manager: &StoreManagerRef,
    ) -> Result<(StoreRef, IndexDatabaseRef)> {
        let store_name = shard_index_indicator(self.db.name(), self.shard_id);
        let index_store = store_manager
            .create_store(&store_name, StoreOptions::default())
            .await?;
        match self.bind_index_database(shard_path, &index_store).await {
            Ok(index_db) => Ok((index_store, index_db)),
            Err(e) => {
                if let Err(close_err) = store_manager.close_store(&store_name).await {
                    error!(
                        store = %store_name,
                        error = %close_err,
                        "Failed to close index store after initialization failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn bind_index_database(
        &self,
        shard_path: &Path,
        index_store: &StoreRef,
    ) -> Result<IndexDatabaseRef> {
        let forward_family = index_store
            .create_family(
                FORWARD_INDEX_FAMILY,
                FamilyOptions {
                    compact_threshold: 0,
                    merger: SERIES_FORWARD_MERGER.to_string(),
                },
            )
            .await?;
        let inverted_family = index_store
            .create_family(
                INVERTED_INDEX_FAMILY,
                FamilyOptions {
                    compact_threshold: 0,
                    merger: SERIES_INVERTED_MERGER.to_string(),
                },
            )
            .await?;
        self.index_db_builder
            .build(
                &shard_path.join(META_DIR),
                self.db.metadata(),
                forward_family,
                inverted_family,
            )
            .await
    }
}

async fn close_hierarchies(targets: &BTreeMap<Interval, IntervalSegmentRef>) {
    for segment in targets.values() {
        segment.close().await;
    }
}

/// One horizontal partition of a database.
pub struct Shard {
    db: DatabaseRef,
    id: ShardId,
    /// `db/shardID`.
    indicator: String,
    metadata: MetadataRef,
    store_manager: StoreManagerRef,
    buffer_manager: BufferManagerRef,

    /// Canonical write interval, the smallest configured one.
    interval: Interval,
    /// Hierarchy of the canonical write interval.
    segment: IntervalSegmentRef,
    /// Every configured interval's hierarchy, the canonical one included.
    rollup_targets: BTreeMap<Interval, IntervalSegmentRef>,

    index_store: StoreRef,
    index_db: IndexDatabaseRef,

    flush_gate: FlushGate,
    metrics: ShardMetrics,
    closed: AtomicBool,
}

pub type ShardRef = Arc<Shard>;

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("indicator", &self.indicator)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Shard {
    pub fn database(&self) -> &DatabaseRef {
        &self.db
    }

    pub fn shard_id(&self) -> ShardId {
        self.id
    }

    /// Unique shard info, `db/shardID`.
    pub fn indicator(&self) -> &str {
        &self.indicator
    }

    /// Canonical interval metric data is written at.
    pub fn current_interval(&self) -> Interval {
        self.interval
    }

    pub fn index_database(&self) -> &IndexDatabaseRef {
        &self.index_db
    }

    pub fn buffer_manager(&self) -> &BufferManagerRef {
        &self.buffer_manager
    }

    /// Returns the canonical data family covering `family_time`, creating it
    /// if absent, and pre-creates the matching family of every rollup
    /// interval so later rollup passes can assume it exists.
    ///
    /// Fails fast on the first rollup that cannot resolve its family; the
    /// canonical family may already exist by then and is not rolled back.
    pub async fn get_or_create_data_family(&self, family_time: Timestamp) -> Result<DataFamilyRef> {
        let family = self.segment.get_or_create_family(family_time).await?;
        for (interval, target) in &self.rollup_targets {
            if *interval == self.interval {
                continue;
            }
            target.get_or_create_family(family_time).await?;
        }
        Ok(family)
    }

    /// Data families matching `interval_type` and overlapping `time_range`.
    ///
    /// The canonical interval is preferred; otherwise the rollup targets are
    /// scanned in ascending interval order. An unconfigured interval type is
    /// a valid empty answer, not an error.
    pub fn get_data_families(
        &self,
        interval_type: IntervalType,
        time_range: TimeRange,
    ) -> Vec<DataFamilyRef> {
        if self.interval.interval_type() == interval_type {
            return self.segment.data_families(time_range);
        }
        for (interval, target) in &self.rollup_targets {
            if interval.interval_type() == interval_type {
                return target.data_families(time_range);
            }
        }
        Vec::new()
    }

    /// Resolves metadata of every row in the batch.
    ///
    /// Always returns `Ok`: a row whose resolution fails (or panics) is
    /// logged, counted and left non-writable, and the batch continues.
    /// Callers inspect [`StorageRow::is_writable`] for per-row outcome.
    pub async fn lookup_row_metric_meta(&self, rows: &mut [StorageRow]) -> Result<()> {
        self.metrics.write_batches.inc();
        for row in rows.iter_mut() {
            let result = AssertUnwindSafe(self.lookup_row_meta(row))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => {
                    self.metrics.write_rows.inc();
                    self.metrics.write_fields.inc_by(row.field_ids.len() as u64);
                }
                Ok(Err(e)) => {
                    self.metrics.lookup_row_meta_failures.inc();
                    error!(
                        db = %self.db.name(),
                        shard = self.id,
                        metric = %row.name(),
                        error = %e,
                        "Failed to lookup meta of row"
                    );
                }
                Err(_) => {
                    self.metrics.lookup_row_meta_failures.inc();
                    error!(
                        db = %self.db.name(),
                        shard = self.id,
                        metric = %row.name(),
                        "Row metadata resolution panicked"
                    );
                }
            }
        }
        Ok(())
    }

    async fn lookup_row_meta(&self, row: &mut StorageRow) -> Result<()> {
        let namespace = row.namespace().unwrap_or(DEFAULT_NAMESPACE).to_string();
        let metric_name = row.name().to_string();

        row.metric_id = self.metadata.gen_metric_id(&namespace, &metric_name).await?;

        let mut created = false;
        if row.tags().is_empty() {
            // A tagless metric always maps to the fixed series ID.
            row.series_id = SERIES_ID_WITHOUT_TAGS;
        } else {
            let (series_id, was_created) = self
                .index_db
                .get_or_create_series_id(row.metric_id, row.tags_hash())
                .await?;
            row.series_id = series_id;
            created = was_created;
        }
        if created {
            // Postings must exist before the row becomes writable.
            self.index_db
                .build_invert_index(&namespace, &metric_name, row.tags(), row.series_id);
        }

        let mut field_ids: SmallVec<[FieldId; 8]> = SmallVec::new();
        for field in row.simple_fields() {
            let field_id = self
                .metadata
                .gen_field_id(&namespace, &metric_name, &field.name, field.field_type)
                .await?;
            field_ids.push(field_id);
        }

        if let Some(compound) = row.compound_field() {
            // A non-positive min/max was never observed and is not
            // materialized as its own field.
            if compound.min > 0.0 {
                field_ids.push(
                    self.metadata
                        .gen_field_id(
                            &namespace,
                            &metric_name,
                            HISTOGRAM_MIN_FIELD_NAME,
                            FieldType::Min,
                        )
                        .await?,
                );
            }
            if compound.max > 0.0 {
                field_ids.push(
                    self.metadata
                        .gen_field_id(
                            &namespace,
                            &metric_name,
                            HISTOGRAM_MAX_FIELD_NAME,
                            FieldType::Max,
                        )
                        .await?,
                );
            }
            // Sum and count both register under the plain sum type; the
            // dictionary tells them apart by field name.
            field_ids.push(
                self.metadata
                    .gen_field_id(
                        &namespace,
                        &metric_name,
                        HISTOGRAM_SUM_FIELD_NAME,
                        FieldType::Sum,
                    )
                    .await?,
            );
            field_ids.push(
                self.metadata
                    .gen_field_id(
                        &namespace,
                        &metric_name,
                        HISTOGRAM_COUNT_FIELD_NAME,
                        FieldType::Sum,
                    )
                    .await?,
            );
            for bound in &compound.explicit_bounds {
                field_ids.push(
                    self.metadata
                        .gen_field_id(
                            &namespace,
                            &metric_name,
                            &histogram_bucket_name(*bound),
                            FieldType::Histogram,
                        )
                        .await?,
                );
            }
        }

        row.field_ids = field_ids;
        row.set_writable(true);
        Ok(())
    }

    /// Flushes the index database.
    ///
    /// At most one flush runs per shard; a flush requested while another is
    /// in flight is a successful no-op. A failure is reported to the caller
    /// after the admission gate is released; retrying belongs to the caller.
    pub async fn flush(&self) -> Result<()> {
        let Some(_permit) = self.flush_gate.try_acquire() else {
            return Ok(());
        };
        let _timer = self.metrics.index_flush_duration.start_timer();

        if let Err(e) = self.index_db.flush().await {
            error!(
                db = %self.db.name(),
                shard = self.id,
                error = %e,
                "Failed to flush index database"
            );
            return Err(e);
        }
        info!(db = %self.db.name(), shard = self.id, "Flushed index database");
        Ok(())
    }

    /// Releases the shard's resources.
    ///
    /// Blocks until an in-flight flush drains, then closes the index
    /// database, the index store and every interval hierarchy. Callable
    /// multiple times; only the first call has effect.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush_gate.wait_drained().await;

        self.index_db.close().await?;
        self.store_manager
            .close_store(self.index_store.name())
            .await?;

        self.segment.close().await;
        for target in self.rollup_targets.values() {
            target.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::error::Error;
    use crate::row::CompoundField;
    use crate::test_util::{
        test_options, FakeDatabase, FakeIndexDatabase, FakeIndexDatabaseBuilder, FakeMetadata,
        RecordingStoreManager,
    };
    use crate::timeutil::{ONE_DAY, ONE_HOUR};

    // 2024-01-01T00:00:00Z
    const JAN_1: Timestamp = 1_704_067_200_000;

    struct TestShard {
        _dir: tempfile::TempDir,
        shard: ShardRef,
        index_db: Arc<FakeIndexDatabase>,
        metadata: Arc<FakeMetadata>,
        store_manager: Arc<RecordingStoreManager>,
    }

    async fn open_shard(intervals: &[&str]) -> TestShard {
        open_shard_with(intervals, FakeMetadata::new()).await
    }

    async fn open_shard_with(intervals: &[&str], metadata: FakeMetadata) -> TestShard {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(metadata);
        let store_manager = Arc::new(RecordingStoreManager::new());
        let index_db = Arc::new(FakeIndexDatabase::new());
        let db = Arc::new(FakeDatabase::new(
            "db",
            test_options(dir.path(), intervals),
            metadata.clone(),
            store_manager.clone(),
        ));
        let shard = ShardOpener::new(
            db,
            1,
            Arc::new(FakeIndexDatabaseBuilder::new(index_db.clone())),
        )
        .open()
        .await
        .unwrap();
        TestShard {
            _dir: dir,
            shard,
            index_db,
            metadata,
            store_manager,
        }
    }

    #[tokio::test]
    async fn test_open_shard() {
        let env = open_shard(&["5m", "10s"]).await;

        assert_eq!(env.shard.shard_id(), 1);
        assert_eq!(env.shard.indicator(), "db/1");
        // The smallest configured interval is the write target.
        assert_eq!(env.shard.current_interval().to_string(), "10s");

        let created = env.store_manager.created.lock().unwrap().clone();
        assert_eq!(created, ["db/1/index"]);
        let families = env.store_manager.created_families.lock().unwrap().clone();
        assert_eq!(families, ["db/1/index:forward", "db/1/index:inverted"]);
    }

    #[tokio::test]
    async fn test_open_shard_without_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let store_manager = Arc::new(RecordingStoreManager::new());
        let db = Arc::new(FakeDatabase::new(
            "db",
            test_options(dir.path(), &[]),
            Arc::new(FakeMetadata::new()),
            store_manager,
        ));
        let index_db = Arc::new(FakeIndexDatabase::new());
        let err = ShardOpener::new(db, 1, Arc::new(FakeIndexDatabaseBuilder::new(index_db)))
            .open()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyIntervals { .. }));
    }

    #[tokio::test]
    async fn test_write_routing_pre_creates_rollup_families() {
        let env = open_shard(&["10s", "5m"]).await;

        let family = env
            .shard
            .get_or_create_data_family(JAN_1 + 10 * ONE_HOUR)
            .await
            .unwrap();
        // The caller writes into the canonical family.
        assert_eq!(family.interval().to_string(), "10s");
        assert_eq!(family.family_time(), JAN_1 + 10 * ONE_HOUR);

        let families = env.store_manager.created_families.lock().unwrap().clone();
        assert!(families.contains(&"db/1/segment/10s/20240101:10".to_string()));
        // The rollup destination exists before any rollup pass runs.
        assert!(families.contains(&"db/1/segment/5m/202401:1".to_string()));

        let again = env
            .shard
            .get_or_create_data_family(JAN_1 + 10 * ONE_HOUR)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&family, &again));
    }

    #[tokio::test]
    async fn test_write_routing_fails_fast_on_rollup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store_manager = Arc::new(
            RecordingStoreManager::new().with_fail_create_containing("segment/5m"),
        );
        let db = Arc::new(FakeDatabase::new(
            "db",
            test_options(dir.path(), &["10s", "5m"]),
            Arc::new(FakeMetadata::new()),
            store_manager.clone(),
        ));
        let index_db = Arc::new(FakeIndexDatabase::new());
        let shard = ShardOpener::new(db, 1, Arc::new(FakeIndexDatabaseBuilder::new(index_db)))
            .open()
            .await
            .unwrap();

        shard.get_or_create_data_family(JAN_1).await.unwrap_err();
        // The canonical family was created before the rollup failed and is
        // not rolled back.
        let families = store_manager.created_families.lock().unwrap().clone();
        assert!(families.contains(&"db/1/segment/10s/20240101:0".to_string()));
    }

    #[tokio::test]
    async fn test_read_routing_by_interval_type() {
        let env = open_shard(&["10s", "5m"]).await;
        env.shard
            .get_or_create_data_family(JAN_1 + 10 * ONE_HOUR)
            .await
            .unwrap();
        let range = TimeRange::new(JAN_1, JAN_1 + ONE_DAY);

        let day = env.shard.get_data_families(IntervalType::Day, range);
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].interval().to_string(), "10s");

        let month = env.shard.get_data_families(IntervalType::Month, range);
        assert_eq!(month.len(), 1);
        assert_eq!(month[0].interval().to_string(), "5m");

        // Unconfigured granularity is a valid empty answer.
        let year = env.shard.get_data_families(IntervalType::Year, range);
        assert!(year.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_tagless_row() {
        let env = open_shard(&["10s"]).await;
        let mut rows = vec![StorageRow::new("cpu", JAN_1).with_simple_field(
            "usage",
            FieldType::Sum,
            1.0,
        )];

        env.shard.lookup_row_metric_meta(&mut rows).await.unwrap();

        assert!(rows[0].is_writable());
        assert_eq!(rows[0].series_id, SERIES_ID_WITHOUT_TAGS);
        assert_eq!(rows[0].metric_id, 1);
        assert_eq!(rows[0].field_ids.as_slice(), [1]);
        // No tags, no inverted index build.
        assert_eq!(env.index_db.build_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_builds_inverted_index_once() {
        let env = open_shard(&["10s"]).await;
        let row = || {
            StorageRow::new("cpu", JAN_1)
                .with_tag("host", "a")
                .with_simple_field("usage", FieldType::Sum, 1.0)
        };
        let mut rows = vec![row(), row()];

        env.shard.lookup_row_metric_meta(&mut rows).await.unwrap();

        assert!(rows[0].is_writable() && rows[1].is_writable());
        assert_eq!(rows[0].series_id, rows[1].series_id);
        assert_ne!(rows[0].series_id, SERIES_ID_WITHOUT_TAGS);
        assert_eq!(env.index_db.build_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resolve_concurrent_same_series() {
        let env = open_shard(&["10s"]).await;
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let shard = env.shard.clone();
            tasks.push(tokio::spawn(async move {
                let mut rows = vec![StorageRow::new("cpu", JAN_1)
                    .with_tag("host", "a")
                    .with_tag("zone", "b")
                    .with_simple_field("usage", FieldType::Sum, 1.0)];
                shard.lookup_row_metric_meta(&mut rows).await.unwrap();
                assert!(rows[0].is_writable());
                rows[0].series_id
            }));
        }
        let mut series_ids = Vec::new();
        for task in tasks {
            series_ids.push(task.await.unwrap());
        }
        series_ids.dedup();
        assert_eq!(series_ids.len(), 1);
        // Exactly one inverted index build across all writers.
        assert_eq!(env.index_db.build_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_compound_field_order() {
        let env = open_shard(&["10s"]).await;
        let mut rows = vec![StorageRow::new("latency", JAN_1).with_compound_field(
            CompoundField {
                count: 10.0,
                sum: 3.5,
                min: 0.0,
                max: 5.0,
                explicit_bounds: vec![1.0, 2.0],
                values: vec![4.0, 6.0],
            },
        )];

        env.shard.lookup_row_metric_meta(&mut rows).await.unwrap();

        assert!(rows[0].is_writable());
        let requests = env.metadata.field_requests.lock().unwrap().clone();
        // Min is skipped because it is not positive; max is included; sum
        // and count share the plain sum type; bounds come last in order.
        assert_eq!(
            requests,
            [
                ("HistogramMax".to_string(), FieldType::Max),
                ("HistogramSum".to_string(), FieldType::Sum),
                ("HistogramCount".to_string(), FieldType::Sum),
                ("__bucket_1".to_string(), FieldType::Histogram),
                ("__bucket_2".to_string(), FieldType::Histogram),
            ]
        );
        assert_eq!(rows[0].field_ids.len(), 5);
    }

    #[tokio::test]
    async fn test_resolve_compound_field_with_positive_min() {
        let env = open_shard(&["10s"]).await;
        let mut rows = vec![StorageRow::new("latency", JAN_1).with_compound_field(
            CompoundField {
                count: 2.0,
                sum: 1.0,
                min: 0.5,
                max: 0.0,
                explicit_bounds: Vec::new(),
                values: Vec::new(),
            },
        )];

        env.shard.lookup_row_metric_meta(&mut rows).await.unwrap();

        let requests = env.metadata.field_requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            [
                ("HistogramMin".to_string(), FieldType::Min),
                ("HistogramSum".to_string(), FieldType::Sum),
                ("HistogramCount".to_string(), FieldType::Sum),
            ]
        );
    }

    #[tokio::test]
    async fn test_batch_isolates_failed_row() {
        let env = open_shard_with(&["10s"], FakeMetadata::new().with_fail_metric("bad")).await;
        let mut rows = vec![
            StorageRow::new("cpu", JAN_1).with_simple_field("usage", FieldType::Sum, 1.0),
            StorageRow::new("bad", JAN_1).with_simple_field("usage", FieldType::Sum, 1.0),
            StorageRow::new("mem", JAN_1).with_simple_field("usage", FieldType::Sum, 1.0),
        ];

        // The batch itself succeeds even though one row failed.
        env.shard.lookup_row_metric_meta(&mut rows).await.unwrap();

        assert!(rows[0].is_writable());
        assert!(!rows[1].is_writable());
        assert!(rows[2].is_writable());
    }

    #[tokio::test]
    async fn test_batch_contains_panicking_row() {
        let env = open_shard_with(&["10s"], FakeMetadata::new().with_panic_metric("boom")).await;
        let mut rows = vec![
            StorageRow::new("cpu", JAN_1).with_simple_field("usage", FieldType::Sum, 1.0),
            StorageRow::new("boom", JAN_1).with_simple_field("usage", FieldType::Sum, 1.0),
            StorageRow::new("mem", JAN_1).with_simple_field("usage", FieldType::Sum, 1.0),
        ];

        env.shard.lookup_row_metric_meta(&mut rows).await.unwrap();

        assert!(rows[0].is_writable());
        assert!(!rows[1].is_writable());
        assert!(rows[2].is_writable());
    }

    #[tokio::test]
    async fn test_flush_deduplicates_concurrent_requests() {
        let env = open_shard(&["10s"]).await;
        let notify = Arc::new(Notify::new());
        env.index_db.set_flush_block(Some(notify.clone()));

        let first = {
            let shard = env.shard.clone();
            tokio::spawn(async move { shard.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(env.index_db.flush_started.load(Ordering::SeqCst), 1);

        // A flush requested while one is running is a successful no-op.
        env.shard.flush().await.unwrap();
        assert_eq!(env.index_db.flush_started.load(Ordering::SeqCst), 1);

        notify.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(env.index_db.flush_count.load(Ordering::SeqCst), 1);

        // The gate is released once the flush finished.
        env.index_db.set_flush_block(None);
        env.shard.flush().await.unwrap();
        assert_eq!(env.index_db.flush_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_failure_releases_gate() {
        let env = open_shard(&["10s"]).await;
        env.index_db.set_fail_flush(true);
        env.shard.flush().await.unwrap_err();

        env.index_db.set_fail_flush(false);
        env.shard.flush().await.unwrap();
        assert_eq!(env.index_db.flush_started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_waits_for_inflight_flush() {
        let env = open_shard(&["10s"]).await;
        env.shard.get_or_create_data_family(JAN_1).await.unwrap();

        let notify = Arc::new(Notify::new());
        env.index_db.set_flush_block(Some(notify.clone()));
        let flusher = {
            let shard = env.shard.clone();
            tokio::spawn(async move { shard.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(env.index_db.flush_started.load(Ordering::SeqCst), 1);

        let closer = {
            let shard = env.shard.clone();
            tokio::spawn(async move { shard.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Close blocks while the flush is in flight.
        assert!(!closer.is_finished());

        notify.notify_one();
        flusher.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), closer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(env.index_db.close_count.load(Ordering::SeqCst), 1);
        let closed = env.store_manager.closed.lock().unwrap().clone();
        assert!(closed.contains(&"db/1/index".to_string()));
        assert!(closed.contains(&"db/1/segment/10s/20240101".to_string()));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let env = open_shard(&["10s"]).await;
        env.shard.close().await.unwrap();
        env.shard.close().await.unwrap();

        assert_eq!(env.index_db.close_count.load(Ordering::SeqCst), 1);
        let closed = env.store_manager.closed.lock().unwrap().clone();
        assert_eq!(closed, ["db/1/index"]);
    }

    #[tokio::test]
    async fn test_abort_closes_opened_hierarchies() {
        let dir = tempfile::tempdir().unwrap();
        // Segments persisted by an earlier run; reloading them opens their
        // stores during construction.
        let segment_root = dir.path().join("db").join("1").join(SEGMENT_DIR);
        std::fs::create_dir_all(segment_root.join("10s").join("20240101")).unwrap();
        std::fs::create_dir_all(segment_root.join("5m").join("202401")).unwrap();
        std::fs::create_dir_all(segment_root.join("1h").join("2024")).unwrap();

        let store_manager = Arc::new(
            RecordingStoreManager::new().with_fail_create_containing("segment/1h"),
        );
        let db = Arc::new(FakeDatabase::new(
            "db",
            test_options(dir.path(), &["10s", "5m", "1h"]),
            Arc::new(FakeMetadata::new()),
            store_manager.clone(),
        ));
        let index_db = Arc::new(FakeIndexDatabase::new());

        // The third hierarchy fails; the first two must be released and the
        // index database never initialized.
        ShardOpener::new(db, 1, Arc::new(FakeIndexDatabaseBuilder::new(index_db)))
            .open()
            .await
            .unwrap_err();

        let closed = store_manager.closed.lock().unwrap().clone();
        assert_eq!(
            closed,
            ["db/1/segment/10s/20240101", "db/1/segment/5m/202401"]
        );
        let created = store_manager.created.lock().unwrap().clone();
        assert!(!created.iter().any(|name| name.ends_with("/index")));
    }

    #[tokio::test]
    async fn test_abort_on_index_builder_failure() {
        let dir = tempfile::tempdir().unwrap();
        let segment_root = dir.path().join("db").join("1").join(SEGMENT_DIR);
        std::fs::create_dir_all(segment_root.join("10s").join("20240101")).unwrap();

        let store_manager = Arc::new(RecordingStoreManager::new());
        let db = Arc::new(FakeDatabase::new(
            "db",
            test_options(dir.path(), &["10s"]),
            Arc::new(FakeMetadata::new()),
            store_manager.clone(),
        ));

        ShardOpener::new(db, 1, Arc::new(FakeIndexDatabaseBuilder::failing()))
            .open()
            .await
            .unwrap_err();

        let closed = store_manager.closed.lock().unwrap().clone();
        assert_eq!(closed, ["db/1/index", "db/1/segment/10s/20240101"]);
    }

    #[tokio::test]
    async fn test_buffer_manager_cleanup_on_open() {
        use crate::buffer::MockBufferManager;

        let dir = tempfile::tempdir().unwrap();
        let store_manager = Arc::new(RecordingStoreManager::new());
        let db = Arc::new(FakeDatabase::new(
            "db",
            test_options(dir.path(), &["10s"]),
            Arc::new(FakeMetadata::new()),
            store_manager,
        ));
        let index_db = Arc::new(FakeIndexDatabase::new());

        let mut buffer_manager = MockBufferManager::new();
        buffer_manager.expect_cleanup().times(1).return_const(());

        ShardOpener::new(db, 1, Arc::new(FakeIndexDatabaseBuilder::new(index_db)))
            .buffer_manager(Arc::new(buffer_manager))
            .open()
            .await
            .unwrap();
    }
}
