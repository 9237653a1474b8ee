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

//! Series index collaborator contract.
//!
//! The index database interns (metric ID, tag-set hash) pairs into series IDs
//! and maintains the forward and inverted tag indexes on top of two key-value
//! families owned by the shard.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::kv::FamilyRef;
use crate::metadata::{MetadataRef, MetricId};
use crate::row::Tag;

/// Compact identifier of one series (metric + tag set).
pub type SeriesId = u32;

/// Fixed series ID of a metric written without tags; never generated.
pub const SERIES_ID_WITHOUT_TAGS: SeriesId = 0;

/// Name of the forward index family within the shard's index store.
pub const FORWARD_INDEX_FAMILY: &str = "forward";

/// Name of the inverted index family within the shard's index store.
pub const INVERTED_INDEX_FAMILY: &str = "inverted";

/// Merge policy applied to the forward index family.
pub const SERIES_FORWARD_MERGER: &str = "series_forward_merger";

/// Merge policy applied to the inverted index family.
pub const SERIES_INVERTED_MERGER: &str = "series_inverted_merger";

/// Per-shard series index.
#[mockall::automock]
#[async_trait]
pub trait IndexDatabase: Send + Sync {
    /// Returns the series ID of (metric ID, tag-set hash) and whether this
    /// call created it.
    ///
    /// Implementations make the lookup-or-create atomic across concurrent
    /// callers and report `created` truthfully; the shard builds inverted
    /// index postings exactly once based on that signal.
    async fn get_or_create_series_id(
        &self,
        metric_id: MetricId,
        tags_hash: u64,
    ) -> Result<(SeriesId, bool)>;

    /// Builds the inverted index postings of a newly created series.
    ///
    /// Fire-and-forget: implementations may defer the work, but must not
    /// block the caller indefinitely.
    fn build_invert_index(
        &self,
        namespace: &str,
        metric: &str,
        tags: &[Tag],
        series_id: SeriesId,
    );

    /// Flushes index data to durable storage.
    async fn flush(&self) -> Result<()>;

    /// Releases index resources.
    async fn close(&self) -> Result<()>;
}

pub type IndexDatabaseRef = Arc<dyn IndexDatabase>;

/// Construction seam binding an index implementation to the shard's two
/// index families and the database-wide metadata dictionary.
#[mockall::automock]
#[async_trait]
pub trait IndexDatabaseBuilder: Send + Sync {
    async fn build(
        &self,
        meta_path: &Path,
        metadata: MetadataRef,
        forward_family: FamilyRef,
        inverted_family: FamilyRef,
    ) -> Result<IndexDatabaseRef>;
}

pub type IndexDatabaseBuilderRef = Arc<dyn IndexDatabaseBuilder>;
