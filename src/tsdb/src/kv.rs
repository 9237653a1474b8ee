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

//! Key-value store collaborator contracts.
//!
//! The physical storage engine lives behind these traits. The shard only
//! creates stores and families and closes them again; everything about the
//! on-disk format, compaction and merging belongs to the implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Options to create a store with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Number of levels the store compacts across.
    pub levels: usize,
}

impl Default for StoreOptions {
    fn default() -> StoreOptions {
        StoreOptions { levels: 2 }
    }
}

/// Options to create a family with.
///
/// `merger` names the merge policy the store applies when compacting this
/// family; the set of known policies is owned by the store implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyOptions {
    pub compact_threshold: u32,
    pub merger: String,
}

/// Manages the lifecycle of named stores.
#[mockall::automock]
#[async_trait]
pub trait StoreManager: Send + Sync {
    /// Creates the store if absent, otherwise opens it.
    async fn create_store(&self, name: &str, options: StoreOptions) -> Result<StoreRef>;

    /// Closes the named store and every family within it.
    async fn close_store(&self, name: &str) -> Result<()>;
}

pub type StoreManagerRef = Arc<dyn StoreManager>;

/// One key-value store holding multiple families.
#[mockall::automock]
#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    /// Creates the family if absent, otherwise opens it.
    async fn create_family(&self, name: &str, options: FamilyOptions) -> Result<FamilyRef>;
}

pub type StoreRef = Arc<dyn Store>;

/// Opaque handle to one family of a store.
#[mockall::automock]
pub trait Family: Send + Sync {
    fn name(&self) -> &str;
}

pub type FamilyRef = Arc<dyn Family>;
