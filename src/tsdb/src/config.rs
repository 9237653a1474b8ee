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

//! Database options consumed by the shard lifecycle.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::timeutil::{Interval, ONE_SECOND};

/// Options of one database, passed in by the orchestration layer.
///
/// `intervals` carries the write interval and every rollup interval; the
/// smallest one becomes the canonical write target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Root directory the database keeps shard data under.
    pub data_path: PathBuf,
    /// Configured write/rollup intervals, in any order.
    pub intervals: Vec<Interval>,
}

impl Default for DatabaseOptions {
    fn default() -> DatabaseOptions {
        DatabaseOptions {
            data_path: PathBuf::from("data"),
            intervals: vec![Interval::from_millis(10 * ONE_SECOND)],
        }
    }
}

impl DatabaseOptions {
    /// Configured intervals sorted ascending with duplicates removed.
    pub fn sorted_intervals(&self) -> Vec<Interval> {
        let mut intervals = self.intervals.clone();
        intervals.sort_unstable();
        intervals.dedup();
        intervals
    }
}
