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
    hash::Hash,
    ops::Deref,
    sync::Arc,
    time::Duration,
};

use equivalent::Equivalent;

use crate::{
    code::{DefaultHashBuilder, HashBuilder, Key, Value},
    error::{Error, ErrorKind, Result},
    event::RemovalListener,
    raw::{Loaded, RawCache, RawCacheConfig},
    record::Record,
    tier::Tier,
};

/// A guard holding one cached value alive.
///
/// The guard is the "external strong reference" the tiers are defined against: as long as any
/// guard for an entry survives, the entry is retrievable on every tier except
/// [`Tier::Phantom`]. Dropping the last guard makes a weak-tier value reclaimable immediately
/// and a soft-tier value reclaimable on the next [`Cache::reclaim`].
pub struct CacheEntry<K, V> {
    record: Arc<Record<K, V>>,
}

impl<K, V> Clone for CacheEntry<K, V> {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
        }
    }
}

impl<K, V> Debug for CacheEntry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry").field("record", &self.record).finish()
    }
}

impl<K, V> Deref for CacheEntry<K, V> {
    type Target = V;

    fn deref(&self) -> &Self::Target {
        self.value()
    }
}

impl<K, V> From<Arc<Record<K, V>>> for CacheEntry<K, V> {
    fn from(record: Arc<Record<K, V>>) -> Self {
        Self { record }
    }
}

impl<K, V> CacheEntry<K, V> {
    /// Key of the cached entry.
    pub fn key(&self) -> &K {
        self.record.key()
    }

    /// Value of the cached entry.
    pub fn value(&self) -> &V {
        self.record.value()
    }

    /// Hash of the cached entry.
    pub fn hash(&self) -> u64 {
        self.record.hash()
    }
}

/// Builder of a [`Cache`].
pub struct CacheBuilder<K, V, S = DefaultHashBuilder>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    tier: Tier,
    capacity: usize,
    shards: usize,
    default_ttl: Option<Duration>,
    hash_builder: S,
    listener: Option<Arc<dyn RemovalListener<K, V>>>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: Key,
    V: Value,
{
    /// Create a cache builder for the given reclamation tier.
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            capacity: 0,
            shards: 8,
            default_ttl: None,
            hash_builder: DefaultHashBuilder::default(),
            listener: None,
        }
    }
}

impl<K, V, S> CacheBuilder<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Set the initial capacity hint of the cache.
    ///
    /// The cache never evicts by size; the hint only pre-allocates the index.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the shard count of the cache.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the default time-to-live of the cache entries.
    ///
    /// Entries without a per-entry override expire this long after insertion. Expiration is
    /// lazy: an expired entry stays in the index until a read or removal discovers it.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set the removal listener of the cache.
    pub fn with_removal_listener(mut self, listener: impl RemovalListener<K, V>) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Set the hash builder of the cache.
    pub fn with_hash_builder<OS>(self, hash_builder: OS) -> CacheBuilder<K, V, OS>
    where
        OS: HashBuilder,
    {
        CacheBuilder {
            tier: self.tier,
            capacity: self.capacity,
            shards: self.shards,
            default_ttl: self.default_ttl,
            hash_builder,
            listener: self.listener,
        }
    }

    /// Build the cache with the given configuration.
    pub fn build(self) -> Result<Cache<K, V, S>> {
        if self.shards == 0 {
            return Err(Error::new(ErrorKind::Config, "shards must be greater than zero").with_context("shards", 0));
        }
        if self.default_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(
                Error::new(ErrorKind::Config, "default ttl must be greater than zero")
                    .with_context("default_ttl", "0s"),
            );
        }

        Ok(Cache {
            raw: RawCache::new(RawCacheConfig {
                tier: self.tier,
                capacity: self.capacity,
                shards: self.shards,
                default_ttl: self.default_ttl,
                hash_builder: self.hash_builder,
                listener: self.listener,
            }),
        })
    }
}

/// A concurrent cache whose values are retained per a reclamation tier.
///
/// All operations are total. Cloning is cheap and every clone refers to the same cache.
pub struct Cache<K, V, S = DefaultHashBuilder>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    raw: RawCache<K, V, S>,
}

impl<K, V, S> Clone for Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn clone(&self) -> Self {
        Self { raw: self.raw.clone() }
    }
}

impl<K, V, S> Debug for Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("tier", &self.raw.tier())
            .field("shards", &self.raw.shards())
            .finish()
    }
}

impl<K, V> Cache<K, V>
where
    K: Key,
    V: Value,
{
    /// Create a builder for a strong-tier cache, which never reclaims on its own.
    pub fn strong() -> CacheBuilder<K, V> {
        CacheBuilder::new(Tier::Strong)
    }

    /// Create a builder for a soft-tier cache, which reclaims only on [`Cache::reclaim`].
    pub fn soft() -> CacheBuilder<K, V> {
        CacheBuilder::new(Tier::Soft)
    }

    /// Create a builder for a weak-tier cache, which reclaims a value as soon as no
    /// [`CacheEntry`] guard for it survives.
    pub fn weak() -> CacheBuilder<K, V> {
        CacheBuilder::new(Tier::Weak)
    }

    /// Create a builder for a phantom-tier cache, which tracks reclamations but never serves a
    /// value.
    pub fn phantom() -> CacheBuilder<K, V> {
        CacheBuilder::new(Tier::Phantom)
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    /// Get the cached entry for the key, if it is present and still retrievable.
    ///
    /// Returns `None` for an absent, reclaimed, expired or phantom-tier entry. A discovered
    /// expired entry is removed on the spot.
    pub fn get<Q>(&self, key: &Q) -> Option<CacheEntry<K, V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.get(key).map(CacheEntry::from)
    }

    /// Get the cached entry for the key, or compute it with the loader.
    ///
    /// At most one loader runs per key under concurrent calls; the losers get the winner's
    /// value. A loader returning `None` caches nothing and the call returns `None`. The loader
    /// must not operate on the same cache.
    ///
    /// On the phantom tier the loader runs on every call, its result is tracked but never
    /// returned.
    pub fn get_or_load<Q, F>(&self, key: &Q, loader: F) -> Option<CacheEntry<K, V>>
    where
        Q: Hash + Equivalent<K> + ToOwned<Owned = K> + ?Sized,
        F: FnOnce(&K) -> Option<V>,
    {
        self.raw
            .get_or_load(key, |key| loader(key).map(Loaded::new))
            .map(CacheEntry::from)
    }

    /// [`Cache::get_or_load`] with control over the loaded value's time-to-live.
    pub fn get_or_load_with<Q, F>(&self, key: &Q, loader: F) -> Option<CacheEntry<K, V>>
    where
        Q: Hash + Equivalent<K> + ToOwned<Owned = K> + ?Sized,
        F: FnOnce(&K) -> Option<Loaded<V>>,
    {
        self.raw.get_or_load(key, loader).map(CacheEntry::from)
    }

    /// Insert the key/value pair, replacing any previous entry for the key.
    ///
    /// Returns the guard for the new entry. A replaced entry departs with
    /// [`crate::RemovalCause::Replaced`] (or the stale cause a read would have assigned it).
    pub fn insert(&self, key: K, value: V) -> CacheEntry<K, V> {
        self.raw.insert(key, value, None).into()
    }

    /// [`Cache::insert`] with a per-entry time-to-live overriding the cache default.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) -> CacheEntry<K, V> {
        self.raw.insert(key, value, Some(ttl)).into()
    }

    /// Remove the entry for the key.
    ///
    /// Returns the removed entry's guard if the value was still alive. The value stays alive as
    /// long as the returned guard does, on every tier.
    pub fn remove<Q>(&self, key: &Q) -> Option<CacheEntry<K, V>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.remove(key).map(CacheEntry::from)
    }

    /// Remove every entry whose value satisfies the predicate.
    ///
    /// Stale entries (expired or reclaimed) and phantom-tier entries are removed
    /// unconditionally. The predicate runs under internal locks and must not operate on the
    /// same cache.
    pub fn remove_if<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.raw.remove_if(f)
    }

    /// Whether a retrievable entry for the key is present.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.contains(key)
    }

    /// Reset the expiration deadline of the entry for the key to `ttl` from now.
    ///
    /// No-op if the key has no retrievable entry.
    pub fn expire<Q>(&self, key: &Q, ttl: Duration)
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.raw.expire(key, ttl)
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.raw.clear()
    }

    /// Drain the reclamation queue, removing index entries whose values are already gone.
    ///
    /// Every other operation drains as a side effect; calling this is only needed to bound
    /// queue growth on an otherwise idle cache. Idempotent.
    pub fn clean(&self) {
        self.raw.clean()
    }

    /// Signal memory pressure, releasing the cache's own hold on every soft-tier value.
    ///
    /// Values kept alive by outstanding guards survive. No-op on other tiers.
    pub fn reclaim(&self) {
        self.raw.reclaim()
    }

    /// The number of entries in the index.
    ///
    /// Expired entries not yet discovered by a read still count.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// The reclamation tier of the cache.
    pub fn tier(&self) -> Tier {
        self.raw.tier()
    }

    /// The default time-to-live of the cache entries.
    pub fn default_ttl(&self) -> Option<Duration> {
        self.raw.default_ttl()
    }

    /// The shard count of the cache.
    pub fn shards(&self) -> usize {
        self.raw.shards()
    }

    /// The hash builder of the cache.
    pub fn hash_builder(&self) -> &S {
        self.raw.hash_builder()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, OnceLock,
    };

    use super::*;
    use crate::event::RemovalCause;

    #[test_log::test]
    fn test_strong_retained_without_guards() {
        let cache: Cache<u64, String> = Cache::strong().build().unwrap();

        drop(cache.insert(1, "v".to_string()));
        assert_eq!(cache.get(&1).as_deref(), Some(&"v".to_string()));
        assert!(cache.contains(&1));
        assert_eq!(cache.len(), 1);

        // The pressure signal only affects the soft tier.
        cache.reclaim();
        assert!(cache.contains(&1));

        assert_eq!(cache.remove(&1).as_deref(), Some(&"v".to_string()));
        assert!(cache.is_empty());
    }

    #[test_log::test]
    fn test_weak_guard_keeps_value_alive() {
        let cache: Cache<u64, u64> = Cache::weak().build().unwrap();

        let e1 = cache.insert(1, 1);
        let e2 = cache.get(&1).unwrap();
        drop(e1);
        assert_eq!(cache.get(&1).as_deref(), Some(&1));

        drop(e2);
        assert!(cache.get(&1).is_none());
        assert!(cache.is_empty());
    }

    #[test_log::test]
    fn test_cached_none_differs_from_absent() {
        let cache: Cache<u64, Option<u64>> = Cache::strong().build().unwrap();

        cache.insert(1, None);

        // Key 1 holds a cached "no value"; key 2 was never loaded.
        assert_eq!(cache.get(&1).as_deref(), Some(&None));
        assert!(cache.get(&2).is_none());

        let loads = AtomicUsize::new(0);
        cache.get_or_load(&1, |_| {
            loads.fetch_add(1, Ordering::Relaxed);
            Some(Some(1))
        });
        assert_eq!(loads.load(Ordering::Relaxed), 0);
    }

    #[test_log::test]
    fn test_loader_runs_at_most_once() {
        let cache: Cache<u64, u64> = Cache::strong().with_shards(1).build().unwrap();
        let loads = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let entry = cache
                        .get_or_load(&1, |_| {
                            loads.fetch_add(1, Ordering::Relaxed);
                            std::thread::sleep(Duration::from_millis(10));
                            Some(42)
                        })
                        .unwrap();
                    assert_eq!(*entry, 42);
                });
            }
        });

        assert_eq!(loads.load(Ordering::Relaxed), 1);
    }

    #[test_log::test]
    fn test_phantom_never_serves() {
        let removed = Arc::new(Mutex::new(vec![]));
        let r = removed.clone();
        let cache: Cache<u64, u64> = Cache::phantom()
            .with_removal_listener(move |key: &u64, value: Option<&u64>, cause: RemovalCause| {
                r.lock().unwrap().push((*key, value.copied(), cause));
            })
            .build()
            .unwrap();

        let entry = cache.insert(1, 1);
        assert!(cache.get(&1).is_none());
        assert!(!cache.contains(&1));
        assert_eq!(cache.len(), 1);

        // A loader-based read recomputes every call even while the record lives.
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            cache.get_or_load(&1, |_| {
                loads.fetch_add(1, Ordering::Relaxed);
                Some(2)
            });
        }
        assert_eq!(loads.load(Ordering::Relaxed), 3);

        drop(entry);
        cache.clear();

        // The listener observes the departures but never the values.
        assert!(removed.lock().unwrap().iter().all(|(_, value, _)| value.is_none()));
    }

    #[test_log::test]
    fn test_expiration_is_lazy() {
        let removed = Arc::new(Mutex::new(vec![]));
        let r = removed.clone();
        let cache: Cache<u64, u64> = Cache::strong()
            .with_removal_listener(move |key: &u64, value: Option<&u64>, cause: RemovalCause| {
                r.lock().unwrap().push((*key, value.copied(), cause));
            })
            .build()
            .unwrap();

        cache.insert_with_ttl(1, 1, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));

        // Still counted until a read discovers it.
        assert_eq!(cache.len(), 1);

        assert!(cache.get(&1).is_none());
        assert!(cache.is_empty());
        assert_eq!(removed.lock().unwrap().as_slice(), &[(1, Some(1), RemovalCause::Expired)]);

        // Discovery already removed it; nothing resurfaces later.
        cache.clean();
        assert!(cache.get(&1).is_none());
        assert_eq!(removed.lock().unwrap().len(), 1);
    }

    #[test_log::test]
    fn test_expire_extends_deadline() {
        let cache: Cache<u64, u64> = Cache::strong()
            .with_default_ttl(Duration::from_millis(10))
            .build()
            .unwrap();

        cache.insert(1, 1);
        cache.expire(&1, Duration::from_secs(600));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&1).as_deref(), Some(&1));

        // Expiring an absent key is a no-op.
        cache.expire(&2, Duration::from_secs(600));
        assert!(cache.get(&2).is_none());
    }

    #[test_log::test]
    fn test_remove_if() {
        let cache: Cache<u64, u64> = Cache::strong().build().unwrap();

        for i in 0..10 {
            cache.insert(i, i);
        }

        cache.remove_if(|_, v| v % 2 == 0);
        assert_eq!(cache.len(), 5);
        assert!(cache.get(&2).is_none());
        assert_eq!(cache.get(&3).as_deref(), Some(&3));

        cache.remove_if(|_, _| true);
        assert!(cache.is_empty());
    }

    #[test_log::test]
    fn test_listener_fires_once_per_departure() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let cache: Cache<u64, u64> = Cache::weak()
            .with_removal_listener(move |_: &u64, _: Option<&u64>, _: RemovalCause| {
                f.fetch_add(1, Ordering::Relaxed);
            })
            .build()
            .unwrap();

        drop(cache.insert(1, 1));
        cache.clean();
        cache.clean();
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        // Explicit removal of a guarded entry: Explicit fires now, the later guard drop stays
        // quiet.
        let entry = cache.insert(2, 2);
        cache.remove(&2);
        assert_eq!(fired.load(Ordering::Relaxed), 2);
        drop(entry);
        cache.clean();
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[test_log::test]
    fn test_removed_guard_keeps_value() {
        let cache: Cache<u64, String> = Cache::weak().build().unwrap();

        let inserted = cache.insert(1, "v".to_string());
        let removed = cache.remove(&1).unwrap();
        drop(inserted);

        assert_eq!(removed.value(), "v");
        assert_eq!(removed.key(), &1);
        assert!(cache.get(&1).is_none());
    }

    #[test_log::test]
    fn test_soft_reclaim_under_pressure() {
        let cache: Cache<u64, u64> = Cache::soft().build().unwrap();

        drop(cache.insert(1, 1));
        let held = cache.insert(2, 2);

        assert_eq!(cache.get(&1).as_deref(), Some(&1));
        cache.reclaim();

        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&2).as_deref(), Some(&2));
        drop(held);
    }

    #[test_log::test]
    fn test_listener_may_reenter_cache() {
        static CACHE: OnceLock<Cache<u64, u64>> = OnceLock::new();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let cache: Cache<u64, u64> = Cache::strong()
            .with_removal_listener(move |_: &u64, _: Option<&u64>, _: RemovalCause| {
                // Never called under a cache lock, so reads from within are fine.
                if let Some(cache) = CACHE.get() {
                    let _ = cache.len();
                }
                f.fetch_add(1, Ordering::Relaxed);
            })
            .build()
            .unwrap();
        let _ = CACHE.set(cache.clone());

        cache.insert(1, 1);
        cache.remove(&1);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test_log::test]
    fn test_concurrent_drop_and_insert() {
        let cache: Cache<u64, u64> = Cache::weak().with_shards(4).build().unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..1000 {
                    drop(cache.insert(1, i));
                }
            });
            s.spawn(|| {
                for _ in 0..1000 {
                    let _ = cache.get(&1);
                    cache.clean();
                }
            });
        });

        let latest = cache.insert(1, u64::MAX);
        cache.clean();
        assert_eq!(cache.get(&1).as_deref(), Some(&u64::MAX));
        drop(latest);
    }

    #[test_log::test]
    fn test_borrowed_key_lookup() {
        let cache: Cache<String, u64> = Cache::strong().build().unwrap();

        cache.insert("foo".to_string(), 1);
        assert_eq!(cache.get("foo").as_deref(), Some(&1));

        let entry = cache.get_or_load("bar", |key| {
            assert_eq!(key, "bar");
            Some(2)
        });
        assert_eq!(entry.as_deref(), Some(&2));
        assert_eq!(cache.remove("foo").as_deref(), Some(&1));
    }

    #[test_log::test]
    fn test_replacement_fires_replaced() {
        let removed = Arc::new(Mutex::new(vec![]));
        let r = removed.clone();
        let cache: Cache<u64, u64> = Cache::strong()
            .with_removal_listener(move |key: &u64, value: Option<&u64>, cause: RemovalCause| {
                r.lock().unwrap().push((*key, value.copied(), cause));
            })
            .build()
            .unwrap();

        cache.insert(1, 1);
        cache.insert(1, 2);
        assert_eq!(cache.get(&1).as_deref(), Some(&2));
        assert_eq!(removed.lock().unwrap().as_slice(), &[(1, Some(1), RemovalCause::Replaced)]);
    }

    #[test_log::test]
    fn test_loader_ttl_override() {
        let cache: Cache<u64, u64> = Cache::strong()
            .with_default_ttl(Duration::from_secs(600))
            .build()
            .unwrap();

        cache.get_or_load_with(&1, |_| Some(Loaded::new(1).with_ttl(Duration::from_millis(5))));
        std::thread::sleep(Duration::from_millis(20));

        assert!(cache.get(&1).is_none());

        // The default applies where the loader does not override.
        cache.get_or_load(&2, |_| Some(2));
        assert_eq!(cache.get(&2).as_deref(), Some(&2));
    }

    #[test_log::test]
    fn test_builder_rejects_zero_shards() {
        let res = Cache::<u64, u64>::strong().with_shards(0).build();
        let err = res.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);

        let res = Cache::<u64, u64>::strong().with_default_ttl(Duration::ZERO).build();
        assert!(res.is_err());
    }

    #[test_log::test]
    fn test_clear_drops_everything() {
        let cache: Cache<u64, u64> = Cache::strong().with_shards(4).build().unwrap();

        for i in 0..64 {
            cache.insert(i, i);
        }
        assert_eq!(cache.len(), 64);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&0).is_none());
    }
}
