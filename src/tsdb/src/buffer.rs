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

//! Write buffer manager collaborator contract.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

/// Manages the shard's in-flight write buffers.
///
/// The shard invokes [`BufferManager::cleanup`] once at construction to
/// discard buffers a prior unclean shutdown left behind; everything else
/// about buffering belongs to the implementation.
#[mockall::automock]
pub trait BufferManager: Send + Sync {
    /// Discards stale write buffers.
    fn cleanup(&self);
}

pub type BufferManagerRef = Arc<dyn BufferManager>;

/// Filesystem-backed buffer manager keeping buffers as directories under one
/// root.
#[derive(Debug)]
pub struct FsBufferManager {
    path: PathBuf,
}

impl FsBufferManager {
    pub fn new(path: impl Into<PathBuf>) -> FsBufferManager {
        FsBufferManager { path: path.into() }
    }
}

impl BufferManager for FsBufferManager {
    fn cleanup(&self) {
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            // The buffer root may not exist yet on a fresh shard.
            Err(_) => return,
        };
        for entry in entries {
            let Ok(entry) = entry else {
                continue;
            };
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "Failed to remove stale write buffer");
            }
        }
    }
}
