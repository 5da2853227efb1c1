// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use corral_rm_connector::{ConnectorError, NodeDescriptor, RmConnector, RmEventHandler};
use corral_types::changes::RmChange;
use corral_types::identifiers::{QueueName, ResourceId, RmResourceId};
use corral_types::resources::PlacedResource;

use crate::cache::{CacheEntry, ResourceCache};

/// Sits between the registry and the real connector: released resources are kept in the
/// [`ResourceCache`] and new asks are served from it when possible.
pub struct CachingRmConnector<C> {
    inner: C,
    cache: Arc<ResourceCache>,
    handler: Mutex<Option<Arc<dyn RmEventHandler>>>,
}

impl<C: RmConnector> CachingRmConnector<C> {
    pub fn new(inner: C, cache: Arc<ResourceCache>) -> Self {
        Self {
            inner,
            cache,
            handler: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Runs one eviction sweep, releasing whatever the policy selected to the resource manager.
    pub async fn evict_once(&self) {
        let evicted = self.cache.evict();
        if evicted.is_empty() {
            return;
        }
        self.release_entries(evicted).await;
    }

    /// Sweeps the cache every `interval` until `cancellation` fires.
    pub async fn run_eviction(self: Arc<Self>, interval: Duration, cancellation: CancellationToken) {
        debug!(?interval, "Resource cache eviction loop started");
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.evict_once().await,
            }
        }
        debug!("Resource cache eviction loop stopped");
    }

    /// Gives every cached entry back to the resource manager. Also done by `unregister`.
    pub async fn stop(&self) {
        let entries = self.cache.drain();
        if !entries.is_empty() {
            info!("Releasing {} cached resources on shutdown", entries.len());
            self.release_entries(entries).await;
        }
    }

    async fn release_entries(&self, entries: Vec<CacheEntry>) {
        let resources = entries
            .into_iter()
            .map(CacheEntry::into_released_resource)
            .collect();
        if let Err(err) = self.inner.release(resources, true).await {
            warn!(%err, "Failed to release cache entries to the resource manager");
        }
    }

    /// Takes a hit over for `resource`. Returns `None` if the connector would not repoint the
    /// cached resource, in which case the entry has already been given back.
    async fn claim(&self, resource: &PlacedResource, entry: CacheEntry) -> Option<CacheEntry> {
        match self
            .inner
            .reassign_resource(entry.rm_resource_id(), resource.resource_id())
            .await
        {
            Ok(true) => return Some(entry),
            Ok(false) => debug!(
                resource_id = %resource.resource_id(),
                cache_id = %entry.cache_id(),
                "Connector refused to reassign cached resource, asking the resource manager instead"
            ),
            Err(err) => warn!(
                %err,
                resource_id = %resource.resource_id(),
                cache_id = %entry.cache_id(),
                "Failed to reassign cached resource, asking the resource manager instead"
            ),
        }
        self.release_entries(vec![entry]).await;
        None
    }

    /// Caches `resource`. Returns `false` if it has to be released for real.
    ///
    /// The entry only becomes visible once the resource manager knows the resource by its
    /// cache id, so no ask can claim it while the reassignment is in flight.
    async fn try_cache(&self, resource: &PlacedResource) -> bool {
        let Some(allocation) = resource.allocation() else {
            return false;
        };
        let cache_id = ResourceId::new();

        match self
            .inner
            .reassign_resource(&allocation.rm_resource_id, cache_id)
            .await
        {
            Ok(true) => self.cache.cache_as(cache_id, resource),
            Ok(false) => {
                debug!(%cache_id, "Connector refused to reassign released resource to the cache");
                false
            }
            Err(err) => {
                warn!(%err, %cache_id, "Failed to reassign released resource to the cache");
                false
            }
        }
    }
}

#[async_trait]
impl<C: RmConnector> RmConnector for CachingRmConnector<C> {
    async fn register(
        &self,
        queue: &QueueName,
        handler: Arc<dyn RmEventHandler>,
    ) -> Result<(), ConnectorError> {
        let invalidating = Arc::new(InvalidatingHandler {
            cache: Arc::clone(&self.cache),
            downstream: Arc::clone(&handler),
        });
        self.inner.register(queue, invalidating).await?;
        *self.handler.lock() = Some(handler);
        Ok(())
    }

    async fn unregister(&self) -> Result<(), ConnectorError> {
        // cached resources go back while the connector still accepts releases
        self.stop().await;
        self.handler.lock().take();
        self.inner.unregister().await
    }

    async fn get_nodes(&self) -> Result<Vec<NodeDescriptor>, ConnectorError> {
        self.inner.get_nodes().await
    }

    async fn reserve(&self, resources: Vec<PlacedResource>) -> Result<(), ConnectorError> {
        let handler = self
            .handler
            .lock()
            .clone()
            .ok_or(ConnectorError::NotRegistered)?;

        let mut hits = Vec::new();
        let mut misses = Vec::with_capacity(resources.len());
        for resource in resources {
            let claimed = match self.cache.find_and_remove(resource.ask()) {
                Some(hit) => self.claim(&resource, hit.entry).await,
                None => None,
            };
            match claimed {
                Some(entry) => hits.push((resource, entry)),
                None => misses.push(resource),
            }
        }

        if !misses.is_empty() {
            if let Err(err) = self.inner.reserve(misses).await {
                // hits already point at the new resource ids
                let claimed: Vec<_> = hits
                    .into_iter()
                    .map(|(mut resource, entry)| {
                        resource.set_allocated(entry.allocation().clone());
                        resource
                    })
                    .collect();
                if !claimed.is_empty() {
                    if let Err(release_err) = self.inner.release(claimed, true).await {
                        warn!(%release_err, "Failed to release cache hits after a failed reserve");
                    }
                }
                return Err(err);
            }
        }

        if hits.is_empty() {
            return Ok(());
        }
        let changes = hits
            .into_iter()
            .map(|(resource, entry)| {
                trace!(resource_id = %resource.resource_id(), "Allocating from the resource cache");
                RmChange::allocated(resource.resource_id(), entry.allocation().clone())
            })
            .collect();
        handler.on_changes(changes).await;
        Ok(())
    }

    async fn release(
        &self,
        resources: Vec<PlacedResource>,
        do_not_cache: bool,
    ) -> Result<(), ConnectorError> {
        if do_not_cache {
            return self.inner.release(resources, true).await;
        }

        let mut to_release = Vec::new();
        for resource in resources {
            if !self.try_cache(&resource).await {
                to_release.push(resource);
            }
        }
        if to_release.is_empty() {
            return Ok(());
        }
        self.inner.release(to_release, false).await
    }

    async fn reassign_resource(
        &self,
        rm_resource_id: &RmResourceId,
        resource_id: ResourceId,
    ) -> Result<bool, ConnectorError> {
        self.inner.reassign_resource(rm_resource_id, resource_id).await
    }
}

/// Drops cache entries the resource manager reports about before forwarding its notifications.
struct InvalidatingHandler {
    cache: Arc<ResourceCache>,
    downstream: Arc<dyn RmEventHandler>,
}

#[async_trait]
impl RmEventHandler for InvalidatingHandler {
    async fn on_changes(&self, changes: Vec<RmChange>) {
        for change in &changes {
            if let Some(entry) = self.cache.invalidate(&change.resource_id()) {
                debug!(
                    cache_id = %entry.cache_id(),
                    kind = %change.kind(),
                    "Resource manager reported about a cached resource, dropping it from the cache"
                );
            }
        }
        self.downstream.on_changes(changes).await;
    }

    async fn stopped_by_rm(&self) {
        let dropped = self.cache.drain();
        if !dropped.is_empty() {
            warn!(
                "Connector stopped by the resource manager, dropping {} cached resources",
                dropped.len()
            );
        }
        self.downstream.stopped_by_rm().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    use test_log::test;
    use tokio::sync::Notify;

    use corral_rm_connector::{ConnectorCall, MockRmConnector};
    use corral_test_util::{assert, assert_eq, let_assert};
    use corral_types::MockClock;
    use corral_types::identifiers::{HandleId, ReservationId};
    use corral_types::resources::{Allocation, Locality, ResourceAsk, ResourceStatus};
    use corral_types::time::MillisSinceEpoch;

    use crate::eviction::{IdleTimeoutEvictionPolicy, NeverEvictPolicy};

    const T: u64 = 1_700_000_000_000;

    #[derive(Default)]
    struct RecordingHandler {
        changes: Mutex<Vec<RmChange>>,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl RmEventHandler for RecordingHandler {
        async fn on_changes(&self, changes: Vec<RmChange>) {
            self.changes.lock().extend(changes);
        }

        async fn stopped_by_rm(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct Fixture {
        clock: MockClock,
        rm: Arc<MockRmConnector>,
        handler: Arc<RecordingHandler>,
        connector: Arc<CachingRmConnector<Arc<MockRmConnector>>>,
    }

    async fn fixture() -> Fixture {
        let clock = MockClock::with_timestamp(MillisSinceEpoch::new(T));
        let cache = Arc::new(ResourceCache::new(
            Arc::new(clock.clone()),
            Box::new(IdleTimeoutEvictionPolicy::new(Duration::from_millis(30_000))),
        ));
        let rm = Arc::new(MockRmConnector::new());
        let connector = Arc::new(CachingRmConnector::new(Arc::clone(&rm), cache));
        let handler = Arc::new(RecordingHandler::default());
        connector
            .register(&QueueName::from("q"), handler.clone())
            .await
            .unwrap();
        rm.clear_calls();
        Fixture {
            clock,
            rm,
            handler,
            connector,
        }
    }

    fn placed(ask: ResourceAsk) -> PlacedResource {
        PlacedResource::new(ask, ReservationId::new(), HandleId::new(), "q".into())
    }

    fn allocated(cpu_vcores: u32, memory_mb: u64, location: &str, rm_id: &str) -> PlacedResource {
        let mut resource = placed(ResourceAsk::new(
            location,
            Locality::DontCare,
            cpu_vcores,
            memory_mb,
        ));
        resource.set_allocated(Allocation {
            cpu_vcores,
            memory_mb,
            location: location.into(),
            rm_resource_id: rm_id.into(),
        });
        resource
    }

    #[test(tokio::test)]
    async fn released_resource_satisfies_matching_ask_without_rm_reserve() {
        let f = fixture().await;

        f.connector
            .release(vec![allocated(1, 1024, "l1", "c1")], false)
            .await
            .unwrap();
        assert!(f.rm.released().is_empty());
        assert_eq!(f.connector.cache().len(), 1);
        let reassignments = f.rm.reassignments();
        let_assert!([(rm_id, _cache_id)] = reassignments.as_slice());
        assert_eq!(rm_id.as_str(), "c1");
        f.rm.clear_calls();

        let ask = placed(ResourceAsk::new("l1", Locality::Must, 1, 1024));
        f.connector.reserve(vec![ask.clone()]).await.unwrap();

        assert!(f.rm.reserved().is_empty());
        assert_eq!(
            f.rm.reassignments(),
            vec![(RmResourceId::from("c1"), ask.resource_id())]
        );
        let changes = f.handler.changes.lock().clone();
        let_assert!([change] = changes.as_slice());
        assert_eq!(change.resource_id(), ask.resource_id());
        assert_eq!(change.status(), ResourceStatus::Allocated);
        assert!(f.connector.cache().is_empty());
    }

    #[test(tokio::test)]
    async fn too_large_ask_misses_and_goes_to_the_rm() {
        let f = fixture().await;
        f.connector
            .release(vec![allocated(1, 1024, "l1", "c1")], false)
            .await
            .unwrap();
        f.rm.clear_calls();

        let ask = placed(ResourceAsk::new("l1", Locality::Must, 2, 1024));
        f.connector.reserve(vec![ask.clone()]).await.unwrap();

        assert_eq!(f.rm.reserved(), vec![ask.resource_id()]);
        assert!(f.handler.changes.lock().is_empty());
        assert_eq!(f.connector.cache().len(), 1);
    }

    #[test(tokio::test)]
    async fn do_not_cache_goes_straight_to_the_rm() {
        let f = fixture().await;
        let resource = allocated(1, 1024, "l1", "c1");

        f.connector
            .release(vec![resource.clone()], true)
            .await
            .unwrap();

        assert_eq!(
            f.rm.calls(),
            vec![ConnectorCall::Release {
                resource_ids: vec![resource.resource_id()],
                do_not_cache: true,
            }]
        );
        assert!(f.connector.cache().is_empty());
    }

    #[test(tokio::test)]
    async fn refused_reassignment_releases_normally() {
        let f = fixture().await;
        f.rm.refuse_reassign(true);
        let resource = allocated(1, 1024, "l1", "c1");

        f.connector
            .release(vec![resource.clone()], false)
            .await
            .unwrap();

        assert!(f.connector.cache().is_empty());
        assert_eq!(f.rm.released(), vec![resource.resource_id()]);
    }

    #[test(tokio::test)]
    async fn refused_reassignment_on_hit_falls_through_to_rm() {
        let f = fixture().await;
        f.connector
            .release(vec![allocated(1, 1024, "l1", "c1")], false)
            .await
            .unwrap();
        f.rm.refuse_reassign(true);
        f.rm.clear_calls();

        let ask = placed(ResourceAsk::new("l1", Locality::Must, 1, 1024));
        f.connector.reserve(vec![ask.clone()]).await.unwrap();

        // the entry went back to the RM and the ask was submitted unchanged
        assert_eq!(f.rm.released().len(), 1);
        assert_eq!(f.rm.reserved(), vec![ask.resource_id()]);
        assert!(f.handler.changes.lock().is_empty());
    }

    #[test(tokio::test)]
    async fn eviction_releases_to_rm_after_idle_timeout() {
        let f = fixture().await;
        f.connector
            .release(vec![allocated(1, 1024, "l1", "c1")], false)
            .await
            .unwrap();
        let reassignments = f.rm.reassignments();
        let_assert!([(_, cache_id)] = reassignments.as_slice());
        let cache_id = *cache_id;
        f.rm.clear_calls();

        f.clock.set(MillisSinceEpoch::new(T + 29_999));
        f.connector.evict_once().await;
        assert!(f.rm.calls().is_empty());
        assert_eq!(f.connector.cache().len(), 1);

        f.clock.set(MillisSinceEpoch::new(T + 30_001));
        f.connector.evict_once().await;
        assert_eq!(
            f.rm.calls(),
            vec![ConnectorCall::Release {
                resource_ids: vec![cache_id],
                do_not_cache: true,
            }]
        );
        assert!(f.connector.cache().is_empty());
    }

    #[test(tokio::test)]
    async fn rm_notification_invalidates_cached_entry() {
        let f = fixture().await;
        f.connector
            .release(vec![allocated(1, 1024, "l1", "c1")], false)
            .await
            .unwrap();
        let reassignments = f.rm.reassignments();
        let_assert!([(_, cache_id)] = reassignments.as_slice());
        let cache_id = *cache_id;

        f.rm.deliver(vec![RmChange::preempted(cache_id)]).await;

        assert!(f.connector.cache().is_empty());
        assert_eq!(
            f.handler.changes.lock().clone(),
            vec![RmChange::preempted(cache_id)]
        );
        assert_eq!(f.connector.cache().stats().invalidations, 1);
    }

    #[test(tokio::test)]
    async fn stopped_by_rm_drops_cache_and_forwards() {
        let f = fixture().await;
        f.connector
            .release(vec![allocated(1, 1024, "l1", "c1")], false)
            .await
            .unwrap();

        f.rm.stop_by_rm().await;

        assert!(f.connector.cache().is_empty());
        assert!(f.handler.stopped.load(Ordering::SeqCst));
    }

    #[test(tokio::test)]
    async fn failed_reserve_gives_hits_back() {
        let f = fixture().await;
        f.connector
            .release(vec![allocated(1, 1024, "l1", "c1")], false)
            .await
            .unwrap();
        f.rm.fail_reserve(true);
        f.rm.clear_calls();

        let hit = placed(ResourceAsk::new("l1", Locality::Must, 1, 1024));
        let miss = placed(ResourceAsk::new("l1", Locality::Must, 8, 8192));
        let_assert!(
            Err(ConnectorError::Unavailable(_)) =
                f.connector.reserve(vec![hit.clone(), miss]).await
        );

        assert_eq!(f.rm.released(), vec![hit.resource_id()]);
        assert!(f.handler.changes.lock().is_empty());
    }

    #[test(tokio::test)]
    async fn reserve_requires_registration() {
        let f = fixture().await;
        f.connector.unregister().await.unwrap();

        let ask = placed(ResourceAsk::new("l1", Locality::Must, 1, 1024));
        let_assert!(Err(ConnectorError::NotRegistered) = f.connector.reserve(vec![ask]).await);
    }

    #[test(tokio::test)]
    async fn stop_releases_remaining_entries() {
        let f = fixture().await;
        f.connector
            .release(
                vec![
                    allocated(1, 1024, "l1", "c1"),
                    allocated(2, 2048, "l2", "c2"),
                ],
                false,
            )
            .await
            .unwrap();
        f.rm.clear_calls();

        f.connector.stop().await;

        assert_eq!(f.rm.released().len(), 2);
        assert!(f.connector.cache().is_empty());
    }

    #[test(tokio::test(start_paused = true))]
    async fn eviction_loop_stops_on_cancellation() {
        let f = fixture().await;
        let cancellation = CancellationToken::new();
        let task = tokio::spawn(
            Arc::clone(&f.connector).run_eviction(Duration::from_secs(5), cancellation.clone()),
        );

        f.connector
            .release(vec![allocated(1, 1024, "l1", "c1")], false)
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(31));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(f.connector.cache().is_empty());

        cancellation.cancel();
        task.await.unwrap();
    }

    #[test(tokio::test)]
    async fn unregister_gives_cached_entries_back_first() {
        let f = fixture().await;
        f.connector
            .release(vec![allocated(1, 1024, "l1", "c1")], false)
            .await
            .unwrap();
        f.rm.clear_calls();

        f.connector.unregister().await.unwrap();

        let calls = f.rm.calls();
        let_assert!(
            [
                ConnectorCall::Release {
                    do_not_cache: true,
                    ..
                },
                ConnectorCall::Unregister
            ] = calls.as_slice()
        );
        assert!(f.connector.cache().is_empty());
    }

    /// Parks every reassignment until `gate` is opened.
    struct GatedConnector {
        inner: Arc<MockRmConnector>,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl RmConnector for GatedConnector {
        async fn register(
            &self,
            queue: &QueueName,
            handler: Arc<dyn RmEventHandler>,
        ) -> Result<(), ConnectorError> {
            self.inner.register(queue, handler).await
        }

        async fn unregister(&self) -> Result<(), ConnectorError> {
            self.inner.unregister().await
        }

        async fn get_nodes(&self) -> Result<Vec<NodeDescriptor>, ConnectorError> {
            self.inner.get_nodes().await
        }

        async fn reserve(&self, resources: Vec<PlacedResource>) -> Result<(), ConnectorError> {
            self.inner.reserve(resources).await
        }

        async fn release(
            &self,
            resources: Vec<PlacedResource>,
            do_not_cache: bool,
        ) -> Result<(), ConnectorError> {
            self.inner.release(resources, do_not_cache).await
        }

        async fn reassign_resource(
            &self,
            rm_resource_id: &RmResourceId,
            resource_id: ResourceId,
        ) -> Result<bool, ConnectorError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.reassign_resource(rm_resource_id, resource_id).await
        }
    }

    #[test(tokio::test)]
    async fn entry_is_not_served_before_its_reassignment_completes() {
        let clock = MockClock::with_timestamp(MillisSinceEpoch::new(T));
        let cache = Arc::new(ResourceCache::new(
            Arc::new(clock),
            Box::new(NeverEvictPolicy),
        ));
        let rm = Arc::new(MockRmConnector::new());
        let gated = Arc::new(GatedConnector {
            inner: Arc::clone(&rm),
            entered: Notify::new(),
            gate: Notify::new(),
        });
        let connector = Arc::new(CachingRmConnector::new(Arc::clone(&gated), cache));
        connector
            .register(
                &QueueName::from("q"),
                Arc::new(RecordingHandler::default()),
            )
            .await
            .unwrap();
        rm.refuse_reassign(true);

        let releasing = tokio::spawn({
            let connector = Arc::clone(&connector);
            async move {
                connector
                    .release(vec![allocated(1, 1024, "l1", "c1")], false)
                    .await
            }
        });
        gated.entered.notified().await;

        // a concurrent matching ask goes to the RM instead of taking the resource
        assert!(connector.cache().is_empty());
        let ask = placed(ResourceAsk::new("l1", Locality::Must, 1, 1024));
        connector.reserve(vec![ask.clone()]).await.unwrap();
        assert_eq!(rm.reserved(), vec![ask.resource_id()]);

        // the refused resource is released exactly once, and never cached
        gated.gate.notify_one();
        releasing.await.unwrap().unwrap();
        assert_eq!(rm.released().len(), 1);
        assert!(connector.cache().is_empty());

        // an accepted reassignment makes the entry visible only afterwards
        rm.refuse_reassign(false);
        let releasing = tokio::spawn({
            let connector = Arc::clone(&connector);
            async move {
                connector
                    .release(vec![allocated(1, 1024, "l1", "c2")], false)
                    .await
            }
        });
        gated.entered.notified().await;
        assert!(connector.cache().is_empty());

        gated.gate.notify_one();
        releasing.await.unwrap().unwrap();
        assert_eq!(connector.cache().len(), 1);
        assert_eq!(rm.released().len(), 1);
    }
}
