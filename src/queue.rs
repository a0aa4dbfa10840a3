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

use std::sync::Arc;

/// A notice posted when a record's value is reclaimed.
///
/// `id` is the record identity; the drain protocol removes an index entry only if the ids match,
/// so a notice for a superseded record never removes a newer live entry for the same key.
pub struct Notice<K> {
    pub key: Arc<K>,
    pub hash: u64,
    pub id: u64,
}

/// The reclamation notification queue.
///
/// Multi-producer (record drop glue on arbitrary threads), multi-consumer (any caller thread may
/// drain). Posting and polling never block.
pub struct ReclaimQueue<K> {
    tx: flume::Sender<Notice<K>>,
    rx: flume::Receiver<Notice<K>>,
}

impl<K> ReclaimQueue<K> {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Get a producer handle for record drop glue.
    pub fn handle(&self) -> ReclaimHandle<K> {
        ReclaimHandle { tx: self.tx.clone() }
    }

    /// Poll the next pending notice, if any.
    pub fn poll(&self) -> Option<Notice<K>> {
        self.rx.try_recv().ok()
    }
}

/// Producer handle of a [`ReclaimQueue`].
pub struct ReclaimHandle<K> {
    tx: flume::Sender<Notice<K>>,
}

impl<K> Clone for ReclaimHandle<K> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<K> ReclaimHandle<K> {
    /// Post a reclaim notice.
    ///
    /// A send failure means the cache (and its receiver) is already gone; nothing is left to
    /// reconcile, so the notice is dropped silently.
    pub fn post(&self, notice: Notice<K>) {
        let _ = self.tx.send(notice);
    }
}
