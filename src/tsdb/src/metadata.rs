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

//! Metadata dictionary collaborator contract.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Compact identifier of a metric name within a namespace.
pub type MetricId = u32;

/// Compact identifier of one field of a metric.
pub type FieldId = u16;

/// Namespace used when a row carries none.
pub const DEFAULT_NAMESPACE: &str = "default-ns";

/// Aggregation kind of a field.
///
/// The kind is part of the dictionary key: the same field name registered
/// under two kinds yields two field IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Sum,
    Min,
    Max,
    Last,
    First,
    Histogram,
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Sum => write!(f, "sum"),
            FieldType::Min => write!(f, "min"),
            FieldType::Max => write!(f, "max"),
            FieldType::Last => write!(f, "last"),
            FieldType::First => write!(f, "first"),
            FieldType::Histogram => write!(f, "histogram"),
        }
    }
}

/// Database-wide dictionary assigning metric and field IDs.
///
/// Implementations must be stable: the same key yields the same ID across
/// calls and process restarts.
#[mockall::automock]
#[async_trait]
pub trait MetadataDatabase: Send + Sync {
    /// Returns the metric ID, assigning a new one on first occurrence.
    async fn gen_metric_id(&self, namespace: &str, metric: &str) -> Result<MetricId>;

    /// Returns the field ID for (namespace, metric, field name, field type),
    /// assigning a new one on first occurrence.
    async fn gen_field_id(
        &self,
        namespace: &str,
        metric: &str,
        field_name: &str,
        field_type: FieldType,
    ) -> Result<FieldId>;
}

pub type MetadataRef = Arc<dyn MetadataDatabase>;
