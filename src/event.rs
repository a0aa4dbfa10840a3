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

/// Cause for a cache entry's removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Manually removed, including [`crate::Cache::remove`], [`crate::Cache::remove_if`] and
    /// [`crate::Cache::clear`].
    Explicit,
    /// Removed due to replacement by a newer entry for the same key.
    Replaced,
    /// Removed after its value was reclaimed.
    Collected,
    /// Removed due to expiration.
    Expired,
}

/// Trait for the customized removal listener.
///
/// The listener is called exactly once per entry departure, from whichever thread performs the
/// removal or drains the reclamation queue. It is never called while a cache lock is held, so it
/// may call back into the same cache.
pub trait RemovalListener<K, V>: Send + Sync + 'static {
    /// Called after an entry has left the cache.
    ///
    /// `value` is `None` when the value has already been reclaimed, and always `None` for the
    /// phantom tier.
    fn on_removal(&self, key: &K, value: Option<&V>, cause: RemovalCause);
}

impl<K, V, F> RemovalListener<K, V> for F
where
    F: Fn(&K, Option<&V>, RemovalCause) + Send + Sync + 'static,
{
    fn on_removal(&self, key: &K, value: Option<&V>, cause: RemovalCause) {
        self(key, value, cause)
    }
}
