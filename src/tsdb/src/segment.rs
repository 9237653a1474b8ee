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

//! Segment hierarchy of one interval.
//!
//! Each configured interval owns an [`IntervalSegment`]: an ordered set of
//! time-bucketed [`Segment`]s, each a key-value store whose families are the
//! physical [`DataFamily`] units writes land in. Everything is created
//! lazily on first use; lookup-or-create of the same (interval, timestamp)
//! always yields the same identity.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use snafu::{ensure, ResultExt};
use tracing::warn;

use crate::error::{CreateDirSnafu, OutOfTimeRangeSnafu, ReadDirSnafu, Result};
use crate::kv::{FamilyOptions, FamilyRef, StoreManagerRef, StoreOptions, StoreRef};
use crate::timeutil::{Interval, TimeRange, Timestamp};

/// Merge policy applied to metric data families.
pub const METRIC_DATA_MERGER: &str = "metric_data_merger";

/// Physical storage unit of one segment at one family time.
pub struct DataFamily {
    interval: Interval,
    family_time: Timestamp,
    time_range: TimeRange,
    family: FamilyRef,
}

pub type DataFamilyRef = Arc<DataFamily>;

impl std::fmt::Debug for DataFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFamily")
            .field("interval", &self.interval)
            .field("family_time", &self.family_time)
            .field("time_range", &self.time_range)
            .finish_non_exhaustive()
    }
}

impl DataFamily {
    fn new(
        interval: Interval,
        family_time: Timestamp,
        time_range: TimeRange,
        family: FamilyRef,
    ) -> DataFamily {
        DataFamily {
            interval,
            family_time,
            time_range,
            family,
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn family_time(&self) -> Timestamp {
        self.family_time
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    /// Underlying key-value family encoded data is written into.
    pub fn family(&self) -> &FamilyRef {
        &self.family
    }
}

/// One time bucket of an interval hierarchy, backed by its own store.
pub struct Segment {
    name: String,
    base_time: Timestamp,
    time_range: TimeRange,
    interval: Interval,
    store: StoreRef,
    families: Mutex<BTreeMap<i32, DataFamilyRef>>,
    // Serializes family creation; lookups go through `families` only.
    create_lock: tokio::sync::Mutex<()>,
}

pub type SegmentRef = Arc<Segment>;

impl Segment {
    fn new(
        name: String,
        base_time: Timestamp,
        time_range: TimeRange,
        interval: Interval,
        store: StoreRef,
    ) -> Segment {
        Segment {
            name,
            base_time,
            time_range,
            interval,
            store,
            families: Mutex::new(BTreeMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_time(&self) -> Timestamp {
        self.base_time
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    /// Returns the data family covering `timestamp`, creating it if absent.
    pub async fn get_or_create_data_family(&self, timestamp: Timestamp) -> Result<DataFamilyRef> {
        ensure!(
            self.time_range.contains(timestamp),
            OutOfTimeRangeSnafu {
                timestamp,
                range: self.time_range,
            }
        );
        let calculator = self.interval.calculator();
        let family = calculator.family(timestamp, self.base_time)?;

        if let Some(data_family) = self.families.lock().unwrap().get(&family) {
            return Ok(data_family.clone());
        }

        let _guard = self.create_lock.lock().await;
        if let Some(data_family) = self.families.lock().unwrap().get(&family) {
            return Ok(data_family.clone());
        }

        let kv_family = self
            .store
            .create_family(
                &family.to_string(),
                FamilyOptions {
                    compact_threshold: 0,
                    merger: METRIC_DATA_MERGER.to_string(),
                },
            )
            .await?;
        let time_range = calculator.family_time_range(self.base_time, family)?;
        let data_family = Arc::new(DataFamily::new(
            self.interval,
            time_range.start,
            time_range,
            kv_family,
        ));
        self.families
            .lock()
            .unwrap()
            .insert(family, data_family.clone());
        Ok(data_family)
    }

    /// Families overlapping `time_range`. Read-only, no creation.
    pub fn data_families(&self, time_range: TimeRange) -> Vec<DataFamilyRef> {
        self.families
            .lock()
            .unwrap()
            .values()
            .filter(|family| family.time_range().overlaps(&time_range))
            .cloned()
            .collect()
    }
}

/// Segment hierarchy of one interval.
pub struct IntervalSegment {
    interval: Interval,
    /// Filesystem directory segments live under.
    dir: PathBuf,
    /// Store name prefix, e.g. `db/1/segment/10s`.
    store_prefix: String,
    store_manager: StoreManagerRef,
    segments: Mutex<HashMap<String, SegmentRef>>,
    // Serializes segment creation; lookups go through `segments` only.
    create_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

pub type IntervalSegmentRef = Arc<IntervalSegment>;

impl IntervalSegment {
    /// Opens the hierarchy, reloading segments an earlier run persisted
    /// under `dir`.
    pub async fn open(
        interval: Interval,
        dir: PathBuf,
        store_prefix: String,
        store_manager: StoreManagerRef,
    ) -> Result<IntervalSegmentRef> {
        std::fs::create_dir_all(&dir).context(CreateDirSnafu {
            path: dir.display().to_string(),
        })?;
        let interval_segment = Arc::new(IntervalSegment {
            interval,
            dir: dir.clone(),
            store_prefix,
            store_manager,
            segments: Mutex::new(HashMap::new()),
            create_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let entries = std::fs::read_dir(&dir).context(ReadDirSnafu {
            path: dir.display().to_string(),
        })?;
        let calculator = interval.calculator();
        for entry in entries {
            let entry = entry.context(ReadDirSnafu {
                path: dir.display().to_string(),
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if calculator.parse_segment_name(&name).is_err() {
                warn!(
                    interval = %interval,
                    segment = %name,
                    "Ignoring unrecognized segment directory"
                );
                continue;
            }
            interval_segment.get_or_create_segment(&name).await?;
        }
        Ok(interval_segment)
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Returns the named segment, creating its directory and store if absent.
    pub async fn get_or_create_segment(&self, name: &str) -> Result<SegmentRef> {
        if let Some(segment) = self.segments.lock().unwrap().get(name) {
            return Ok(segment.clone());
        }

        let _guard = self.create_lock.lock().await;
        if let Some(segment) = self.segments.lock().unwrap().get(name) {
            return Ok(segment.clone());
        }

        let calculator = self.interval.calculator();
        let base_time = calculator.parse_segment_name(name)?;
        let time_range = calculator.segment_time_range(base_time)?;

        let segment_dir = self.dir.join(name);
        std::fs::create_dir_all(&segment_dir).context(CreateDirSnafu {
            path: segment_dir.display().to_string(),
        })?;
        let store = self
            .store_manager
            .create_store(&self.store_name(name), StoreOptions::default())
            .await?;
        let segment = Arc::new(Segment::new(
            name.to_string(),
            base_time,
            time_range,
            self.interval,
            store,
        ));
        self.segments
            .lock()
            .unwrap()
            .insert(name.to_string(), segment.clone());
        Ok(segment)
    }

    /// Returns the data family covering `timestamp`, creating the segment
    /// and family if absent.
    pub async fn get_or_create_family(&self, timestamp: Timestamp) -> Result<DataFamilyRef> {
        let name = self.interval.calculator().segment_name(timestamp)?;
        let segment = self.get_or_create_segment(&name).await?;
        segment.get_or_create_data_family(timestamp).await
    }

    /// Families overlapping `time_range` across all segments. Read-only.
    pub fn data_families(&self, time_range: TimeRange) -> Vec<DataFamilyRef> {
        let mut segments: Vec<SegmentRef> =
            self.segments.lock().unwrap().values().cloned().collect();
        segments.sort_unstable_by_key(|segment| segment.base_time());

        segments
            .iter()
            .filter(|segment| segment.time_range().overlaps(&time_range))
            .flat_map(|segment| segment.data_families(time_range))
            .collect()
    }

    /// Closes every owned segment store. Callable multiple times; only the
    /// first call has effect. Store-close failures are logged, not
    /// propagated, so teardown always visits every segment.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let names: Vec<String> = self.segments.lock().unwrap().keys().cloned().collect();
        for name in names {
            let store_name = self.store_name(&name);
            if let Err(e) = self.store_manager.close_store(&store_name).await {
                warn!(store = %store_name, error = %e, "Failed to close segment store");
            }
        }
    }

    fn store_name(&self, segment_name: &str) -> String {
        format!("{}/{}", self.store_prefix, segment_name)
    }
}
