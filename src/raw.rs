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
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use equivalent::Equivalent;
use hashbrown::HashTable;
use itertools::Itertools;
use parking_lot::RwLock;

use crate::{
    code::{HashBuilder, Key, Value},
    event::{RemovalCause, RemovalListener},
    queue::ReclaimQueue,
    record::Record,
    scope::Scope,
    tier::{Holder, Tier},
};

/// A value produced by a loader, with an optional per-entry time-to-live override.
pub struct Loaded<V> {
    value: V,
    ttl: Option<Duration>,
}

impl<V> Loaded<V> {
    /// Wrap a loaded value, expiring per the cache default.
    pub fn new(value: V) -> Self {
        Self { value, ttl: None }
    }

    /// Override the cache's default time-to-live for this value.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

pub struct RawCacheConfig<K, V, S> {
    pub tier: Tier,
    pub capacity: usize,
    pub shards: usize,
    pub default_ttl: Option<Duration>,
    pub hash_builder: S,
    pub listener: Option<Arc<dyn RemovalListener<K, V>>>,
}

/// One keyed slot of the index.
///
/// `id` duplicates the record identity so that staleness can be judged even after the record
/// itself is gone.
struct CacheSlot<K, V> {
    key: Arc<K>,
    hash: u64,
    id: u64,
    holder: Holder<K, V>,
    expires_at: Option<Instant>,
}

impl<K, V> CacheSlot<K, V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An entry departure collected under a shard lock, to be reported after the lock is released.
struct Garbage<K, V> {
    key: Arc<K>,
    record: Option<Arc<Record<K, V>>>,
    cause: RemovalCause,
}

/// Turn a removed slot into garbage, retiring its record so the drop glue stays quiet.
///
/// The phantom tier never exposes its value, not even to the listener.
fn into_garbage<K, V>(slot: CacheSlot<K, V>, cause: RemovalCause) -> Garbage<K, V> {
    let record = slot.holder.attached();
    if let Some(record) = record.as_ref() {
        record.retire();
    }
    let record = if slot.holder.is_phantom() { None } else { record };
    Garbage {
        key: slot.key,
        record,
        cause,
    }
}

/// The cause a stale-or-replaced slot leaves with.
fn departure_cause<K, V>(slot: &CacheSlot<K, V>, now: Instant) -> RemovalCause {
    if slot.is_expired(now) {
        RemovalCause::Expired
    } else if slot.holder.is_reclaimed() {
        RemovalCause::Collected
    } else {
        RemovalCause::Replaced
    }
}

struct RawCacheShard<K, V> {
    table: HashTable<CacheSlot<K, V>>,
}

struct RawCacheInner<K, V, S>
where
    K: 'static,
    V: 'static,
{
    shards: Vec<RwLock<RawCacheShard<K, V>>>,

    tier: Tier,
    default_ttl: Option<Duration>,

    hash_builder: S,
    queue: ReclaimQueue<K>,
    id_gen: AtomicU64,

    listener: Option<Arc<dyn RemovalListener<K, V>>>,
}

impl<K, V, S> Drop for RawCacheInner<K, V, S>
where
    K: 'static,
    V: 'static,
{
    fn drop(&mut self) {
        let mut garbages = vec![];
        for shard in self.shards.iter() {
            shard.write().with(|mut shard| {
                garbages.extend(shard.table.drain().map(|slot| into_garbage(slot, RemovalCause::Explicit)));
            });
        }

        // Do not fire the listener within the lock section.
        if let Some(listener) = self.listener.as_ref() {
            for garbage in garbages {
                listener.on_removal(&garbage.key, garbage.record.as_ref().map(|r| r.value()), garbage.cause);
            }
        }
    }
}

pub struct RawCache<K, V, S>
where
    K: 'static,
    V: 'static,
{
    inner: Arc<RawCacheInner<K, V, S>>,
}

impl<K, V, S> Clone for RawCache<K, V, S>
where
    K: 'static,
    V: 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, S> RawCache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    pub fn new(config: RawCacheConfig<K, V, S>) -> Self {
        assert!(config.shards > 0, "shards must be greater than zero.");

        let shards = (0..config.shards)
            .map(|index| RawCacheShard {
                table: HashTable::with_capacity(Self::shard_capacity_for(config.capacity, config.shards, index)),
            })
            .map(RwLock::new)
            .collect_vec();

        let inner = RawCacheInner {
            shards,
            tier: config.tier,
            default_ttl: config.default_ttl,
            hash_builder: config.hash_builder,
            queue: ReclaimQueue::new(),
            id_gen: AtomicU64::new(0),
            listener: config.listener,
        };

        Self { inner: Arc::new(inner) }
    }

    pub fn tier(&self) -> Tier {
        self.inner.tier
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.inner.default_ttl
    }

    pub fn hash_builder(&self) -> &S {
        &self.inner.hash_builder
    }

    pub fn shards(&self) -> usize {
        self.inner.shards.len()
    }

    /// Drain the reclamation queue, reconciling the index with reclamations that already
    /// happened.
    ///
    /// Removal during the drain is governed by record identity, not key equality: a newer live
    /// entry for the same key must survive a notice posted for its predecessor. Idempotent and
    /// non-blocking; concurrent drains split the pending notices between themselves.
    pub fn clean(&self) {
        while let Some(notice) = self.inner.queue.poll() {
            let garbage = self.inner.shards[self.shard(notice.hash)].write().with(|mut shard| {
                match shard
                    .table
                    .find_entry(notice.hash, |slot| slot.key.as_ref() == notice.key.as_ref())
                {
                    Ok(occupied) if occupied.get().id == notice.id => {
                        tracing::trace!("[cache]: drain notice (hash: {}, id: {})", notice.hash, notice.id);
                        let (slot, _) = occupied.remove();
                        Some(into_garbage(slot, RemovalCause::Collected))
                    }
                    _ => None,
                }
            });
            if let Some(garbage) = garbage {
                self.notify(std::iter::once(garbage));
            }
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<Record<K, V>>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.clean();

        let now = Instant::now();
        let hash = self.inner.hash_builder.hash_one(key);

        enum Lookup<R> {
            Hit(R),
            Dead,
            Expired(u64),
        }

        let lookup = self.inner.shards[self.shard(hash)].read().with(|shard| {
            shard
                .table
                .find(hash, |slot| key.equivalent(slot.key.as_ref()))
                .map(|slot| {
                    if slot.is_expired(now) {
                        Lookup::Expired(slot.id)
                    } else {
                        match slot.holder.retrieve() {
                            Some(record) => Lookup::Hit(record),
                            // Reclaimed (its notice is already queued) or phantom.
                            None => Lookup::Dead,
                        }
                    }
                })
        });

        match lookup {
            None | Some(Lookup::Dead) => None,
            Some(Lookup::Hit(record)) => Some(record),
            Some(Lookup::Expired(id)) => {
                self.remove_slot(hash, key, id, RemovalCause::Expired);
                None
            }
        }
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.clean();

        let now = Instant::now();
        let hash = self.inner.hash_builder.hash_one(key);

        self.inner.shards[self.shard(hash)].read().with(|shard| {
            shard
                .table
                .find(hash, |slot| key.equivalent(slot.key.as_ref()))
                .is_some_and(|slot| !slot.is_expired(now) && slot.holder.retrieve().is_some())
        })
    }

    /// Get the value for the key, or run the loader to populate it.
    ///
    /// The loader runs inside the per-shard write-lock critical section, so at most one loader
    /// runs per key under concurrent calls. The loader must not call back into a key of the same
    /// cache shard. A loader returning `None` stores nothing (a discovered-stale mapping is still
    /// removed); a loader panic propagates to the caller and stores nothing.
    pub fn get_or_load<Q, F>(&self, key: &Q, loader: F) -> Option<Arc<Record<K, V>>>
    where
        Q: Hash + Equivalent<K> + ToOwned<Owned = K> + ?Sized,
        F: FnOnce(&K) -> Option<Loaded<V>>,
    {
        self.clean();

        let now = Instant::now();
        let hash = self.inner.hash_builder.hash_one(key);

        let (res, garbages) = self.inner.shards[self.shard(hash)].write().with(|mut shard| {
            let mut garbages = vec![];

            // Re-check under the lock: a concurrent loader may have won already.
            if let Some(slot) = shard.table.find(hash, |slot| key.equivalent(slot.key.as_ref())) {
                if !slot.is_expired(now) {
                    if let Some(record) = slot.holder.retrieve() {
                        return (Some(record), garbages);
                    }
                }
            }

            let key = key.to_owned();
            let loaded = loader(&key);

            // The mapping found above, if any, is stale (or phantom, which recomputes every
            // call); drop it regardless of the loader result.
            if let Ok(occupied) = shard.table.find_entry(hash, |slot| key.equivalent(slot.key.as_ref())) {
                let cause = departure_cause(occupied.get(), now);
                let (slot, _) = occupied.remove();
                garbages.push(into_garbage(slot, cause));
            }

            match loaded {
                None => (None, garbages),
                Some(Loaded { value, ttl }) => {
                    let (record, slot) = self.make_slot(Arc::new(key), value, hash, ttl, now);
                    shard.table.insert_unique(hash, slot, |slot| slot.hash);
                    (Some(record), garbages)
                }
            }
        });

        self.notify(garbages);
        res
    }

    pub fn insert(&self, key: K, value: V, ttl: Option<Duration>) -> Arc<Record<K, V>> {
        self.clean();

        let now = Instant::now();
        let hash = self.inner.hash_builder.hash_one(&key);
        let (record, slot) = self.make_slot(Arc::new(key), value, hash, ttl, now);

        let garbage = self.inner.shards[self.shard(hash)].write().with(|mut shard| {
            let old = match shard
                .table
                .find_entry(hash, |slot| slot.key.as_ref() == record.key())
            {
                Ok(occupied) => {
                    let cause = departure_cause(occupied.get(), now);
                    let (old, _) = occupied.remove();
                    Some(into_garbage(old, cause))
                }
                Err(_) => None,
            };
            shard.table.insert_unique(hash, slot, |slot| slot.hash);
            old
        });

        self.notify(garbage);
        record
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<Record<K, V>>>
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.clean();

        let hash = self.inner.hash_builder.hash_one(key);

        let (record, garbage) = self.inner.shards[self.shard(hash)].write().with(|mut shard| {
            match shard.table.find_entry(hash, |slot| key.equivalent(slot.key.as_ref())) {
                Ok(occupied) => {
                    let (slot, _) = occupied.remove();
                    let garbage = into_garbage(slot, RemovalCause::Explicit);
                    (garbage.record.clone(), Some(garbage))
                }
                Err(_) => (None, None),
            }
        });

        self.notify(garbage);
        record
    }

    /// Remove every entry whose live value satisfies the predicate, and every stale entry
    /// unconditionally.
    ///
    /// The predicate runs under the shard write lock; phantom entries have no inspectable value
    /// and are removed unconditionally.
    pub fn remove_if<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.clean();

        let now = Instant::now();

        for shard in self.inner.shards.iter() {
            let mut garbages = vec![];
            shard.write().with(|mut shard| {
                let victims = shard
                    .table
                    .iter()
                    .filter_map(|slot| {
                        let cause = if slot.is_expired(now) {
                            RemovalCause::Expired
                        } else {
                            match slot.holder.retrieve() {
                                Some(record) => {
                                    if !f(record.key(), record.value()) {
                                        return None;
                                    }
                                    RemovalCause::Explicit
                                }
                                None if slot.holder.is_reclaimed() => RemovalCause::Collected,
                                // A live phantom entry: no value to inspect.
                                None => RemovalCause::Explicit,
                            }
                        };
                        Some((slot.hash, slot.id, cause))
                    })
                    .collect_vec();

                for (hash, id, cause) in victims {
                    if let Ok(occupied) = shard.table.find_entry(hash, |slot| slot.id == id) {
                        let (slot, _) = occupied.remove();
                        garbages.push(into_garbage(slot, cause));
                    }
                }
            });
            self.notify(garbages);
        }
    }

    pub fn clear(&self) {
        self.clean();

        for shard in self.inner.shards.iter() {
            let garbages = shard.write().with(|mut shard| {
                shard
                    .table
                    .drain()
                    .map(|slot| into_garbage(slot, RemovalCause::Explicit))
                    .collect_vec()
            });
            self.notify(garbages);
        }
    }

    /// Reset the expiration deadline of a live retrievable entry from now.
    ///
    /// No-op if the key is absent, expired, reclaimed, or phantom. Does not fire the listener.
    pub fn expire<Q>(&self, key: &Q, ttl: Duration)
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        self.clean();

        let now = Instant::now();
        let hash = self.inner.hash_builder.hash_one(key);

        self.inner.shards[self.shard(hash)].write().with(|mut shard| {
            if let Some(slot) = shard.table.find_mut(hash, |slot| key.equivalent(slot.key.as_ref())) {
                if !slot.is_expired(now) && slot.holder.retrieve().is_some() {
                    slot.expires_at = Some(now + ttl);
                }
            }
        });
    }

    /// The embedder's memory-pressure signal.
    ///
    /// Releases the cache-held strong half of every soft-tier entry; values survive only as long
    /// as outstanding guards keep them alive. Entries reclaimed on the spot are drained before
    /// returning.
    pub fn reclaim(&self) {
        tracing::debug!("[cache]: reclaim soft holds (tier: {:?})", self.inner.tier);
        for shard in self.inner.shards.iter() {
            shard.write().with(|mut shard| {
                for slot in shard.table.iter_mut() {
                    slot.holder.shed();
                }
            });
        }
        self.clean();
    }

    /// The entry count, after draining the reclamation queue.
    ///
    /// Expired-but-unread entries still count until a read or removal discovers them.
    pub fn len(&self) -> usize {
        self.clean();
        self.inner.shards.iter().map(|shard| shard.read().table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_slot<Q>(&self, hash: u64, key: &Q, id: u64, cause: RemovalCause)
    where
        Q: Hash + Equivalent<K> + ?Sized,
    {
        let garbage = self.inner.shards[self.shard(hash)].write().with(|mut shard| {
            match shard.table.find_entry(hash, |slot| key.equivalent(slot.key.as_ref())) {
                Ok(occupied) if occupied.get().id == id => {
                    let (slot, _) = occupied.remove();
                    Some(into_garbage(slot, cause))
                }
                _ => None,
            }
        });
        self.notify(garbage);
    }

    fn make_slot(
        &self,
        key: Arc<K>,
        value: V,
        hash: u64,
        ttl: Option<Duration>,
        now: Instant,
    ) -> (Arc<Record<K, V>>, CacheSlot<K, V>) {
        let id = self.inner.id_gen.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(Record::new(key.clone(), value, hash, id, self.inner.queue.handle()));
        let slot = CacheSlot {
            key,
            hash,
            id,
            holder: Holder::new(self.inner.tier, &record),
            expires_at: ttl.or(self.inner.default_ttl).map(|ttl| now + ttl),
        };
        (record, slot)
    }

    /// Fire the listener for collected garbage, strictly outside any lock section.
    fn notify(&self, garbages: impl IntoIterator<Item = Garbage<K, V>>) {
        let Some(listener) = self.inner.listener.as_ref() else {
            return;
        };
        for garbage in garbages {
            listener.on_removal(&garbage.key, garbage.record.as_ref().map(|r| r.value()), garbage.cause);
        }
    }

    fn shard(&self, hash: u64) -> usize {
        hash as usize % self.inner.shards.len()
    }

    fn shard_capacity_for(total: usize, shards: usize, index: usize) -> usize {
        let base = total / shards;
        let remainder = total % shards;
        base + usize::from(index < remainder)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::queue::Notice;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<RawCache<u64, u64, ahash::RandomState>>();
    }

    fn cache_for_test(tier: Tier) -> RawCache<u64, u64, ahash::RandomState> {
        RawCache::new(RawCacheConfig {
            tier,
            capacity: 16,
            shards: 4,
            default_ttl: None,
            hash_builder: Default::default(),
            listener: None,
        })
    }

    #[test_log::test]
    fn test_drain_identity() {
        let cache = cache_for_test(Tier::Weak);

        let entry = cache.insert(1, 1, None);
        let hash = entry.hash();

        // A forged notice with a stale identity must not remove the live entry.
        cache.inner.queue.handle().post(Notice {
            key: Arc::new(1),
            hash,
            id: entry.id() + 1,
        });
        cache.clean();
        assert_eq!(cache.get(&1).map(|r| *r.value()), Some(1));

        // A notice carrying the real identity removes it.
        cache.inner.queue.handle().post(Notice {
            key: Arc::new(1),
            hash,
            id: entry.id(),
        });
        cache.clean();
        assert!(cache.get(&1).is_none());
        assert!(cache.is_empty());
    }

    #[test_log::test]
    fn test_reclaim_notice_for_replaced_entry_is_ignored() {
        let listened = Arc::new(AtomicUsize::new(0));
        let l = listened.clone();
        let cache: RawCache<u64, u64, ahash::RandomState> = RawCache::new(RawCacheConfig {
            tier: Tier::Weak,
            capacity: 16,
            shards: 4,
            default_ttl: None,
            hash_builder: Default::default(),
            listener: Some(Arc::new(move |_: &u64, _: Option<&u64>, _: RemovalCause| {
                l.fetch_add(1, Ordering::Relaxed);
            })),
        });

        // Replacing retires the old record, so dropping its guard afterwards posts nothing and
        // the listener fires exactly once (for the replacement).
        let old = cache.insert(1, 1, None);
        let new = cache.insert(1, 2, None);
        assert_eq!(listened.load(Ordering::Relaxed), 1);

        drop(old);
        cache.clean();
        assert_eq!(listened.load(Ordering::Relaxed), 1);
        assert_eq!(cache.get(&1).map(|r| *r.value()), Some(2));
        drop(new);
    }

    #[test_log::test]
    fn test_weak_reclaims_on_last_guard_drop() {
        let cache = cache_for_test(Tier::Weak);

        let entry = cache.insert(1, 1, None);
        assert_eq!(cache.get(&1).map(|r| *r.value()), Some(1));

        drop(entry);
        assert!(cache.get(&1).is_none());
        assert!(cache.is_empty());
    }

    #[test_log::test]
    fn test_soft_survives_until_reclaim() {
        let cache = cache_for_test(Tier::Soft);

        drop(cache.insert(1, 1, None));
        assert_eq!(cache.get(&1).map(|r| *r.value()), Some(1));

        // Keep a guard on key 2 across the pressure signal.
        let held = cache.get_or_load(&2, |_| Some(Loaded::new(2))).unwrap();

        cache.reclaim();
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&2).map(|r| *r.value()), Some(2));

        drop(held);
        assert!(cache.get(&2).is_none());
        assert!(cache.is_empty());
    }

    #[test_log::test]
    fn test_loader_none_stores_nothing() {
        let cache = cache_for_test(Tier::Strong);

        assert!(cache.get_or_load(&1, |_| None).is_none());
        assert!(cache.is_empty());
    }
}
