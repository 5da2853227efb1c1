// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use corral_types::Clock;
use corral_types::identifiers::{Location, ResourceId, RmResourceId};
use corral_types::resources::{Allocation, Locality, PlacedResource, ResourceAsk};
use corral_types::time::MillisSinceEpoch;

use crate::eviction::EvictionPolicy;
use crate::metric_definitions::{
    CACHE_EVICTED, CACHE_HIT, CACHE_INSERTED, CACHE_INVALIDATED, CACHE_MISS, CACHE_SIZE,
};

/// Cache buckets are keyed by capacity, memory first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Capacity {
    memory_mb: u64,
    cpu_vcores: u32,
}

impl Capacity {
    fn of(memory_mb: u64, cpu_vcores: u32) -> Self {
        Self {
            memory_mb,
            cpu_vcores,
        }
    }

    fn fits(&self, ask: &ResourceAsk) -> bool {
        self.memory_mb >= ask.memory_mb && self.cpu_vcores >= ask.cpu_vcores
    }
}

/// A released resource which the resource manager still holds for us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    cache_id: ResourceId,
    released: PlacedResource,
    allocation: Allocation,
    cached_on: MillisSinceEpoch,
}

impl CacheEntry {
    pub fn cache_id(&self) -> ResourceId {
        self.cache_id
    }

    pub fn rm_resource_id(&self) -> &RmResourceId {
        &self.allocation.rm_resource_id
    }

    pub fn location(&self) -> &Location {
        &self.allocation.location
    }

    pub fn cpu_vcores(&self) -> u32 {
        self.allocation.cpu_vcores
    }

    pub fn memory_mb(&self) -> u64 {
        self.allocation.memory_mb
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn cached_on(&self) -> MillisSinceEpoch {
        self.cached_on
    }

    /// The resource as it must be handed to the resource manager once the entry leaves the
    /// cache without being consumed: identified by the cache id it was reassigned to.
    pub fn into_released_resource(self) -> PlacedResource {
        let mut resource = PlacedResource::new(
            self.released.ask().clone().with_resource_id(self.cache_id),
            self.released.reservation_id(),
            self.released.handle(),
            self.released.queue().clone(),
        );
        resource.set_allocated(self.allocation);
        resource
    }

    fn capacity(&self) -> Capacity {
        Capacity::of(self.allocation.memory_mb, self.allocation.cpu_vcores)
    }

    fn index_key(&self) -> (Location, ResourceId) {
        (self.allocation.location.clone(), self.cache_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    /// The entry sits on exactly the requested location.
    StrictLocation,
    /// The entry has enough capacity but lives somewhere else.
    AnyLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub kind: HitKind,
    pub entry: CacheEntry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ResourceId, CacheEntry>,
    by_capacity: BTreeMap<Capacity, BTreeSet<(Location, ResourceId)>>,
    stats: CacheStats,
}

impl CacheState {
    fn insert(&mut self, entry: CacheEntry) {
        self.by_capacity
            .entry(entry.capacity())
            .or_default()
            .insert(entry.index_key());
        self.entries.insert(entry.cache_id, entry);
    }

    /// Picks the bucket and key to serve `ask` from, without removing anything.
    fn lookup(&self, ask: &ResourceAsk) -> Option<(Capacity, (Location, ResourceId), HitKind)> {
        let wanted = Capacity::of(ask.memory_mb, ask.cpu_vcores);
        let mut smallest_fit = None;

        // buckets are visited smallest first, so the first exact location found is the
        // tightest one
        for (capacity, bucket) in self.by_capacity.range(wanted..) {
            if !capacity.fits(ask) || bucket.is_empty() {
                continue;
            }
            let from = (ask.location.clone(), ResourceId::from(0));
            if let Some(key) = bucket
                .range(from..)
                .next()
                .filter(|(location, _)| *location == ask.location)
            {
                return Some((*capacity, key.clone(), HitKind::StrictLocation));
            }
            if smallest_fit.is_none() {
                smallest_fit = bucket.first().map(|key| (*capacity, key.clone()));
            }
        }

        match ask.locality {
            Locality::Must => None,
            Locality::Preferred | Locality::DontCare => {
                smallest_fit.map(|(capacity, key)| (capacity, key, HitKind::AnyLocation))
            }
        }
    }

    fn remove_from_bucket(&mut self, capacity: Capacity, key: &(Location, ResourceId)) -> bool {
        let Some(bucket) = self.by_capacity.get_mut(&capacity) else {
            return false;
        };
        let removed = bucket.remove(key);
        if bucket.is_empty() {
            self.by_capacity.remove(&capacity);
        }
        removed
    }

    /// The `entries` record is authoritative: an entry missing from the capacity index is
    /// still returned, so the resource manager gets it back.
    fn remove_by_id(&mut self, cache_id: &ResourceId) -> Option<CacheEntry> {
        let entry = self.entries.remove(cache_id)?;
        if !self.remove_from_bucket(entry.capacity(), &entry.index_key()) {
            error!(
                %cache_id,
                "Resource cache inconsistency: entry is missing from the capacity index"
            );
        }
        Some(entry)
    }
}

/// Keeps just-released resources around so that new asks with matching capacity can be
/// satisfied without a round trip to the resource manager.
pub struct ResourceCache {
    state: Mutex<CacheState>,
    clock: Arc<dyn Clock>,
    policy: Box<dyn EvictionPolicy>,
}

impl ResourceCache {
    pub fn new(clock: Arc<dyn Clock>, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            clock,
            policy,
        }
    }

    /// Stores an allocated resource under a freshly minted cache id, which is returned.
    /// Resources without an allocation can't be cached.
    pub fn cache(&self, resource: &PlacedResource) -> Option<ResourceId> {
        let cache_id = ResourceId::new();
        self.cache_as(cache_id, resource).then_some(cache_id)
    }

    /// Stores an allocated resource under `cache_id`, which the resource manager must already
    /// know the resource by. Returns `false` if the resource has no allocation.
    pub fn cache_as(&self, cache_id: ResourceId, resource: &PlacedResource) -> bool {
        let Some(allocation) = resource.allocation().cloned() else {
            return false;
        };
        let entry = CacheEntry {
            cache_id,
            released: resource.clone(),
            allocation,
            cached_on: self.clock.now(),
        };

        trace!(
            %cache_id,
            resource_id = %resource.resource_id(),
            location = %entry.location(),
            "Caching released resource"
        );
        let mut state = self.state.lock();
        state.insert(entry);
        counter!(CACHE_INSERTED).increment(1);
        gauge!(CACHE_SIZE).set(state.entries.len() as f64);

        true
    }

    /// Finds, and removes, an entry able to satisfy `ask`.
    ///
    /// The smallest bucket with enough memory and cpu wins. With [`Locality::Must`] only an
    /// entry on the requested location is a hit; otherwise such an entry is preferred but any
    /// entry with enough capacity is acceptable.
    pub fn find_and_remove(&self, ask: &ResourceAsk) -> Option<CacheHit> {
        let mut state = self.state.lock();

        let hit = state.lookup(ask).and_then(|(capacity, key, kind)| {
            state.remove_from_bucket(capacity, &key);
            match state.entries.remove(&key.1) {
                Some(entry) => Some(CacheHit { kind, entry }),
                None => {
                    error!(
                        cache_id = %key.1,
                        "Resource cache inconsistency: indexed entry is missing, treating it as a miss"
                    );
                    None
                }
            }
        });

        if let Some(hit) = &hit {
            state.stats.hits += 1;
            counter!(CACHE_HIT).increment(1);
            debug!(
                resource_id = %ask.resource_id,
                cache_id = %hit.entry.cache_id,
                kind = ?hit.kind,
                "Resource cache hit"
            );
        } else {
            state.stats.misses += 1;
            counter!(CACHE_MISS).increment(1);
        }
        gauge!(CACHE_SIZE).set(state.entries.len() as f64);

        hit
    }

    /// Removes the entry with `cache_id`, if still cached.
    pub fn find_and_remove_by_id(&self, cache_id: &ResourceId) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let entry = state.remove_by_id(cache_id);
        gauge!(CACHE_SIZE).set(state.entries.len() as f64);
        entry
    }

    /// Drops an entry the resource manager reported about while it was cached.
    pub fn invalidate(&self, cache_id: &ResourceId) -> Option<CacheEntry> {
        let entry = self.find_and_remove_by_id(cache_id)?;
        self.state.lock().stats.invalidations += 1;
        counter!(CACHE_INVALIDATED).increment(1);
        Some(entry)
    }

    /// Runs the eviction policy over every entry and removes those it selects.
    pub fn evict(&self) -> Vec<CacheEntry> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let to_evict: Vec<ResourceId> = state
            .entries
            .values()
            .filter(|entry| self.policy.should_evict(entry, now))
            .map(CacheEntry::cache_id)
            .collect();

        let evicted: Vec<CacheEntry> = to_evict
            .iter()
            .filter_map(|cache_id| state.remove_by_id(cache_id))
            .collect();

        if !evicted.is_empty() {
            debug!("Evicted {} entries from the resource cache", evicted.len());
            state.stats.evictions += evicted.len() as u64;
            counter!(CACHE_EVICTED).increment(evicted.len() as u64);
        }
        gauge!(CACHE_SIZE).set(state.entries.len() as f64);

        evicted
    }

    /// Empties the cache, returning everything it held.
    pub fn drain(&self) -> Vec<CacheEntry> {
        let mut state = self.state.lock();
        state.by_capacity.clear();
        let entries = state.entries.drain().map(|(_, entry)| entry).collect();
        gauge!(CACHE_SIZE).set(0.0);
        entries
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, cache_id: &ResourceId) -> bool {
        self.state.lock().entries.contains_key(cache_id)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            size: state.entries.len(),
            ..state.stats
        }
    }
}
