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

//! Write-path coordinator of a time-series storage engine.
//!
//! A [`shard::Shard`] owns one horizontal partition of a database: it resolves
//! raw metric rows into compact numeric IDs, routes writes into time-bucketed
//! data families across every configured rollup interval, and serializes flush
//! of the partition's index structures.
//!
//! The physical key-value engine, the index implementation, the write buffer
//! and the metadata dictionary are collaborators behind traits; this crate
//! coordinates them.

pub mod buffer;
pub mod config;
pub mod error;
mod flush;
pub mod index;
pub mod kv;
pub mod metadata;
pub mod metrics;
pub mod row;
pub mod segment;
pub mod shard;
#[cfg(any(test, feature = "test"))]
pub mod test_util;
pub mod timeutil;

pub use crate::shard::{Database, DatabaseRef, Shard, ShardId, ShardOpener, ShardRef};
