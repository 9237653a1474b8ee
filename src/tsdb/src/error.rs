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

use snafu::{Location, Snafu};

use crate::timeutil::{TimeRange, Timestamp};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to create directory {}", path))]
    CreateDir {
        path: String,
        #[snafu(source)]
        error: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to read directory {}", path))]
    ReadDir {
        path: String,
        #[snafu(source)]
        error: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid interval string: {}", input))]
    InvalidInterval {
        input: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Database options contain no intervals"))]
    EmptyIntervals {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid segment name: {}", name))]
    InvalidSegmentName {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invalid timestamp: {}", timestamp))]
    InvalidTimestamp {
        timestamp: Timestamp,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Timestamp {} is out of the segment time range {}",
        timestamp,
        range
    ))]
    OutOfTimeRange {
        timestamp: Timestamp,
        range: TimeRange,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to register shard metrics"))]
    RegisterMetrics {
        #[snafu(source)]
        error: prometheus::Error,
        #[snafu(implicit)]
        location: Location,
    },

    /// Escape hatch for collaborator implementations that fail for reasons
    /// this crate has no dedicated variant for.
    #[snafu(display("Unexpected: {}", reason))]
    Unexpected {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
