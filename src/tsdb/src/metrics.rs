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

//! Per-shard metrics.
//!
//! Built against the registry the owning database injects at construction;
//! every metric carries `db`/`shard` const labels.

use std::collections::HashMap;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use snafu::ResultExt;

use crate::error::{RegisterMetricsSnafu, Result};
use crate::shard::ShardId;

/// Database label.
pub const DB_LABEL: &str = "db";
/// Shard label.
pub const SHARD_LABEL: &str = "shard";

#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Counter of row batches submitted for metadata resolution.
    pub(crate) write_batches: IntCounter,
    /// Counter of rows whose metadata resolved successfully.
    pub(crate) write_rows: IntCounter,
    /// Counter of field IDs resolved.
    pub(crate) write_fields: IntCounter,
    /// Counter of rows whose metadata resolution failed or panicked.
    pub(crate) lookup_row_meta_failures: IntCounter,
    /// Elapsed time of index database flushes.
    pub(crate) index_flush_duration: Histogram,
}

impl ShardMetrics {
    pub fn new(registry: &Registry, db: &str, shard_id: ShardId) -> Result<ShardMetrics> {
        let labels = HashMap::from([
            (DB_LABEL.to_string(), db.to_string()),
            (SHARD_LABEL.to_string(), shard_id.to_string()),
        ]);

        let write_batches = IntCounter::with_opts(
            Opts::new("tsdb_shard_write_batches_total", "row batches submitted")
                .const_labels(labels.clone()),
        )
        .context(RegisterMetricsSnafu)?;
        let write_rows = IntCounter::with_opts(
            Opts::new("tsdb_shard_write_rows_total", "rows resolved")
                .const_labels(labels.clone()),
        )
        .context(RegisterMetricsSnafu)?;
        let write_fields = IntCounter::with_opts(
            Opts::new("tsdb_shard_write_fields_total", "field ids resolved")
                .const_labels(labels.clone()),
        )
        .context(RegisterMetricsSnafu)?;
        let lookup_row_meta_failures = IntCounter::with_opts(
            Opts::new(
                "tsdb_shard_lookup_row_meta_failures_total",
                "row metadata resolution failures",
            )
            .const_labels(labels.clone()),
        )
        .context(RegisterMetricsSnafu)?;
        let index_flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tsdb_shard_index_flush_duration_seconds",
                "index database flush elapsed",
            )
            .const_labels(labels),
        )
        .context(RegisterMetricsSnafu)?;

        registry
            .register(Box::new(write_batches.clone()))
            .context(RegisterMetricsSnafu)?;
        registry
            .register(Box::new(write_rows.clone()))
            .context(RegisterMetricsSnafu)?;
        registry
            .register(Box::new(write_fields.clone()))
            .context(RegisterMetricsSnafu)?;
        registry
            .register(Box::new(lookup_row_meta_failures.clone()))
            .context(RegisterMetricsSnafu)?;
        registry
            .register(Box::new(index_flush_duration.clone()))
            .context(RegisterMetricsSnafu)?;

        Ok(ShardMetrics {
            write_batches,
            write_rows,
            write_fields,
            lookup_row_meta_failures,
            index_flush_duration,
        })
    }
}
