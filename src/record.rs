// Copyright 2025 refcache Project Authors
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

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::queue::{Notice, ReclaimHandle};

/// [`Record`] is the shared cell holding one cached key/value pair.
///
/// The index entry and every [`crate::CacheEntry`] guard share the same record through `Arc`.
/// When the last reference drops, the drop glue reports the reclamation to the cache's queue,
/// unless the record was already retired by an explicit removal path.
pub struct Record<K, V> {
    key: Arc<K>,
    value: V,
    hash: u64,
    id: u64,
    retired: AtomicBool,
    reclaim: ReclaimHandle<K>,
}

impl<K, V> Debug for Record<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("hash", &self.hash)
            .field("id", &self.id)
            .finish()
    }
}

impl<K, V> Record<K, V> {
    /// Create a record.
    pub fn new(key: Arc<K>, value: V, hash: u64, id: u64, reclaim: ReclaimHandle<K>) -> Self {
        Self {
            key,
            value,
            hash,
            id,
            retired: AtomicBool::new(false),
            reclaim,
        }
    }

    /// Get the immutable reference of the record key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Get the immutable reference of the record value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Get the record hash.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Get the record identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the record as already reconciled with the index.
    ///
    /// A retired record's drop glue stays quiet, so an entry removed by the cache itself never
    /// reports a second time through the queue.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl<K, V> Drop for Record<K, V> {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::Acquire) {
            tracing::trace!("[record]: record (hash: {}, id: {}) reclaimed", self.hash, self.id);
            self.reclaim.post(Notice {
                key: self.key.clone(),
                hash: self.hash,
                id: self.id,
            });
        }
    }
}
