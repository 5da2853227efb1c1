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
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use corral_rm_connector::{NodeDescriptor, RmConnector, RmEventHandler};
use corral_types::Clock;
use corral_types::changes::RmChange;
use corral_types::identifiers::{HandleId, QueueName, ReservationId};
use corral_types::resources::{PlacedReservation, Reservation};

use crate::broker::ReservationBroker;
use crate::error::{ReservationError, validate_reservation};
use crate::listener::{ListenerId, Listeners, ReservationListener};
use crate::metric_definitions::{
    CHANGES_APPLIED, CHANGES_IGNORED, RESERVATIONS_ACTIVE, RESERVATIONS_PLACED,
    RESERVATIONS_RELEASED, RESERVATIONS_TORN_DOWN,
};
use crate::state::{Reconciliation, RegistryState};

/// Tracks every in-flight reservation of one queue and reconciles the resource manager's
/// notifications against them.
///
/// State is only touched under the registry's lock. Connector calls and listener dispatch
/// happen after the lock is dropped, on data computed while holding it.
pub struct ReservationRegistry {
    queue: QueueName,
    connector: Arc<dyn RmConnector>,
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
    listeners: Listeners,
    stopped: AtomicBool,
}

impl ReservationRegistry {
    pub fn new(queue: QueueName, connector: Arc<dyn RmConnector>, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue,
            connector,
            clock,
            state: Mutex::new(RegistryState::default()),
            listeners: Listeners::default(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Registers with the connector, which will deliver its notifications to this registry.
    pub async fn start(self: &Arc<Self>) -> Result<(), ReservationError> {
        let handler: Arc<dyn RmEventHandler> = Arc::clone(self) as _;
        self.connector.register(&self.queue, handler).await?;
        info!(queue = %self.queue, "Reservation registry started");
        Ok(())
    }

    /// Releases every reservation without caching and unregisters from the connector.
    pub async fn stop(&self) -> Result<(), ReservationError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let removed = {
            let mut state = self.state.lock();
            let removed = state.remove_where(|_| true);
            gauge!(RESERVATIONS_ACTIVE).set(0.0);
            removed
        };
        if let Err(err) = self.release_removed(&removed, true).await {
            warn!(%err, queue = %self.queue, "Failed to release reservations on shutdown");
        }
        self.connector.unregister().await?;
        info!(
            queue = %self.queue,
            "Reservation registry stopped, released {} reservations",
            removed.len()
        );
        Ok(())
    }

    /// Tracks `reservation` and submits its resources. Used directly to re-submit a reservation
    /// which keeps its identity and placement time.
    ///
    /// The reservation is tracked before it is submitted, since allocations may be reported
    /// while submitting. If submission fails, it is dropped again.
    pub async fn place(
        &self,
        reservation: PlacedReservation,
    ) -> Result<PlacedReservation, ReservationError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ReservationError::Shutdown);
        }
        let reservation_id = reservation.reservation_id();
        let resources = reservation.resources().to_vec();
        {
            let mut state = self.state.lock();
            state.insert(reservation.clone())?;
            gauge!(RESERVATIONS_ACTIVE).set(state.len() as f64);
        }

        if let Err(err) = self.connector.reserve(resources).await {
            let mut state = self.state.lock();
            state.remove(&reservation_id);
            gauge!(RESERVATIONS_ACTIVE).set(state.len() as f64);
            return Err(err.into());
        }

        counter!(RESERVATIONS_PLACED).increment(1);
        debug!(
            %reservation_id,
            handle = %reservation.handle(),
            gang = reservation.is_gang(),
            "Reservation placed"
        );
        Ok(self.get_reservation(&reservation_id).unwrap_or(reservation))
    }

    pub fn get_reservations_for_handle(&self, handle: HandleId) -> Vec<PlacedReservation> {
        self.state.lock().filter(|r| r.handle() == handle)
    }

    pub fn reservation_count(&self) -> usize {
        self.state.lock().len()
    }

    async fn release_removed(
        &self,
        removed: &[PlacedReservation],
        do_not_cache: bool,
    ) -> Result<(), ReservationError> {
        let resources: Vec<_> = removed
            .iter()
            .flat_map(|reservation| reservation.resources().iter().cloned())
            .collect();
        if resources.is_empty() {
            return Ok(());
        }
        counter!(RESERVATIONS_RELEASED).increment(removed.len() as u64);
        self.connector.release(resources, do_not_cache).await?;
        Ok(())
    }

    fn reconcile(&self, changes: Vec<RmChange>) -> Reconciliation {
        let mut state = self.state.lock();
        let outcome = state.reconcile(changes, self.clock.now());
        gauge!(RESERVATIONS_ACTIVE).set(state.len() as f64);
        drop(state);

        counter!(CHANGES_APPLIED).increment(outcome.applied);
        counter!(CHANGES_IGNORED).increment(outcome.ignored);
        counter!(RESERVATIONS_TORN_DOWN).increment(outcome.torn_down);
        outcome
    }
}

#[async_trait]
impl RmEventHandler for ReservationRegistry {
    async fn on_changes(&self, changes: Vec<RmChange>) {
        if changes.is_empty() {
            return;
        }
        let outcome = self.reconcile(changes);

        if !outcome.to_release.is_empty() {
            let count = outcome.to_release.len();
            if let Err(err) = self.connector.release(outcome.to_release, false).await {
                // already dropped locally, the resource manager stays authoritative
                warn!(
                    %err,
                    queue = %self.queue,
                    "Failed to release {count} resources of torn-down reservations"
                );
            }
        }
        self.listeners.dispatch(outcome.events);
    }

    async fn stopped_by_rm(&self) {
        warn!(
            queue = %self.queue,
            "Connector stopped by the resource manager, every held resource is lost"
        );
        let lost = self
            .state
            .lock()
            .resource_ids()
            .into_iter()
            .map(RmChange::lost)
            .collect();
        let outcome = self.reconcile(lost);
        if !outcome.to_release.is_empty() {
            debug!(
                "Not releasing {} resources of torn-down reservations, the connector is gone",
                outcome.to_release.len()
            );
        }
        self.listeners.dispatch(outcome.events);
    }
}

#[async_trait]
impl ReservationBroker for ReservationRegistry {
    async fn reserve(
        &self,
        reservation_id: ReservationId,
        reservation: Reservation,
    ) -> Result<PlacedReservation, ReservationError> {
        validate_reservation(&reservation)?;
        let placed = PlacedReservation::new(reservation_id, reservation, self.clock.now());
        self.place(placed).await
    }

    fn get_reservation(&self, reservation_id: &ReservationId) -> Option<PlacedReservation> {
        self.state.lock().get(reservation_id).cloned()
    }

    async fn release_reservation(
        &self,
        handle: HandleId,
        reservation_id: ReservationId,
        do_not_cache: bool,
    ) -> Result<Option<PlacedReservation>, ReservationError> {
        let removed = {
            let mut state = self.state.lock();
            let removed = match state.get(&reservation_id) {
                None => {
                    warn!(%reservation_id, %handle, "Ignoring release of an unknown reservation");
                    None
                }
                Some(reservation) if reservation.handle() != handle => {
                    warn!(
                        %reservation_id,
                        %handle,
                        owner = %reservation.handle(),
                        "Ignoring release of a reservation owned by another handle"
                    );
                    None
                }
                Some(_) => state.remove(&reservation_id),
            };
            gauge!(RESERVATIONS_ACTIVE).set(state.len() as f64);
            removed
        };

        let Some(removed) = removed else {
            return Ok(None);
        };
        debug!(%reservation_id, %handle, "Releasing reservation");
        self.release_removed(std::slice::from_ref(&removed), do_not_cache)
            .await?;
        Ok(Some(removed))
    }

    async fn release_reservations_for_handle(
        &self,
        handle: HandleId,
        do_not_cache: bool,
    ) -> Result<Vec<PlacedReservation>, ReservationError> {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.remove_where(|r| r.handle() == handle);
            gauge!(RESERVATIONS_ACTIVE).set(state.len() as f64);
            removed
        };
        debug!(%handle, "Releasing {} reservations of handle", removed.len());
        self.release_removed(&removed, do_not_cache).await?;
        Ok(removed)
    }

    async fn release_reservations_for_queue(
        &self,
        queue: &QueueName,
        do_not_cache: bool,
    ) -> Result<Vec<PlacedReservation>, ReservationError> {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.remove_where(|r| r.queue() == queue);
            gauge!(RESERVATIONS_ACTIVE).set(state.len() as f64);
            removed
        };
        debug!(%queue, "Releasing {} reservations of queue", removed.len());
        self.release_removed(&removed, do_not_cache).await?;
        Ok(removed)
    }

    fn add_listener(&self, listener: Arc<dyn ReservationListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, listener_id: ListenerId) -> bool {
        self.listeners.remove(listener_id)
    }

    async fn get_nodes(&self) -> Result<Vec<NodeDescriptor>, ReservationError> {
        Ok(self.connector.get_nodes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use corral_rm_connector::{ConnectorCall, ConnectorError, MockRmConnector};
    use corral_test_util::{assert, assert_eq, let_assert};
    use corral_types::MockClock;
    use corral_types::events::ReservationEvent;
    use corral_types::identifiers::ResourceId;
    use corral_types::resources::{Allocation, Locality, ReservationStatus, ResourceAsk};

    struct Fixture {
        rm: Arc<MockRmConnector>,
        registry: Arc<ReservationRegistry>,
        events: Arc<Mutex<Vec<ReservationEvent>>>,
    }

    async fn fixture() -> Fixture {
        let rm = Arc::new(MockRmConnector::new());
        let registry = Arc::new(ReservationRegistry::new(
            "q".into(),
            rm.clone(),
            Arc::new(MockClock::new()),
        ));
        registry.start().await.unwrap();
        rm.clear_calls();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        registry.add_listener(Arc::new(move |event: &ReservationEvent| {
            sink.lock().push(event.clone())
        }));

        Fixture {
            rm,
            registry,
            events,
        }
    }

    fn reservation(handle: HandleId, gang: bool) -> Reservation {
        Reservation::new(
            handle,
            "q",
            gang,
            vec![
                ResourceAsk::new("l1", Locality::DontCare, 1, 1024),
                ResourceAsk::new("l2", Locality::DontCare, 2, 2048),
            ],
        )
    }

    fn allocated(resource_id: ResourceId) -> RmChange {
        RmChange::allocated(
            resource_id,
            Allocation {
                cpu_vcores: 1,
                memory_mb: 1024,
                location: "l1".into(),
                rm_resource_id: format!("rm-{resource_id}").into(),
            },
        )
    }

    fn resource_ids(reservation: &PlacedReservation) -> Vec<ResourceId> {
        reservation
            .resources()
            .iter()
            .map(|r| r.resource_id())
            .collect()
    }

    #[test(tokio::test)]
    async fn reserve_tracks_and_submits() {
        let f = fixture().await;
        let id = ReservationId::new();

        let placed = f
            .registry
            .reserve(id, reservation(HandleId::new(), true))
            .await
            .unwrap();

        assert_eq!(placed.status(), ReservationStatus::Pending);
        assert_eq!(f.rm.reserved(), resource_ids(&placed));
        assert_eq!(f.registry.get_reservation(&id), Some(placed));
        assert_eq!(f.registry.reservation_count(), 1);
    }

    #[test(tokio::test)]
    async fn failed_submission_leaves_nothing_behind() {
        let f = fixture().await;
        f.rm.fail_reserve(true);
        let id = ReservationId::new();

        let_assert!(
            Err(ReservationError::Connector(ConnectorError::Unavailable(_))) = f
                .registry
                .reserve(id, reservation(HandleId::new(), false))
                .await
        );
        assert!(f.registry.get_reservation(&id).is_none());
        assert_eq!(f.registry.reservation_count(), 0);
    }

    #[test(tokio::test)]
    async fn invalid_and_duplicate_reservations_are_refused() {
        let f = fixture().await;
        let handle = HandleId::new();
        let_assert!(
            Err(ReservationError::InvalidReservation(_)) = f
                .registry
                .reserve(ReservationId::new(), Reservation::new(handle, "q", true, vec![]))
                .await
        );

        let id = ReservationId::new();
        f.registry.reserve(id, reservation(handle, true)).await.unwrap();
        let_assert!(
            Err(ReservationError::InvalidReservation(_)) =
                f.registry.reserve(id, reservation(handle, true)).await
        );
        assert!(f.rm.reserved().len() == 2);
    }

    #[test(tokio::test)]
    async fn release_of_unknown_or_foreign_reservation_is_a_no_op() {
        let f = fixture().await;
        let owner = HandleId::new();
        let id = ReservationId::new();
        f.registry.reserve(id, reservation(owner, false)).await.unwrap();
        f.rm.clear_calls();

        let_assert!(
            Ok(None) = f
                .registry
                .release_reservation(owner, ReservationId::new(), false)
                .await
        );
        let_assert!(
            Ok(None) = f
                .registry
                .release_reservation(HandleId::new(), id, false)
                .await
        );
        assert!(f.rm.calls().is_empty());

        let_assert!(Ok(Some(released)) = f.registry.release_reservation(owner, id, true).await);
        assert_eq!(released.status(), ReservationStatus::Ended);
        assert_eq!(
            f.rm.calls(),
            vec![ConnectorCall::Release {
                resource_ids: resource_ids(&released),
                do_not_cache: true,
            }]
        );
        assert_eq!(f.registry.reservation_count(), 0);
    }

    #[test(tokio::test)]
    async fn gang_scenario_through_the_connector() {
        let f = fixture().await;
        let id = ReservationId::new();
        let placed = f
            .registry
            .reserve(id, reservation(HandleId::new(), true))
            .await
            .unwrap();
        let [r1, r2] = resource_ids(&placed)[..] else {
            panic!("two resources expected");
        };

        f.rm.deliver(vec![allocated(r1)]).await;
        assert!(f.events.lock().is_empty());
        assert_eq!(
            f.registry.get_reservation(&id).unwrap().status(),
            ReservationStatus::Partial
        );

        f.rm.deliver(vec![allocated(r2)]).await;
        let events = f.events.lock().clone();
        let_assert!([event] = events.as_slice());
        assert_eq!(event.allocated_resources.len(), 2);
        assert_eq!(event.allocated_reservation_ids, vec![id]);
        assert_eq!(
            f.registry.get_reservation(&id).unwrap().status(),
            ReservationStatus::Allocated
        );
    }

    #[test(tokio::test)]
    async fn gang_teardown_releases_siblings_once() {
        let f = fixture().await;
        let id = ReservationId::new();
        let placed = f
            .registry
            .reserve(id, reservation(HandleId::new(), true))
            .await
            .unwrap();
        let [r1, r2] = resource_ids(&placed)[..] else {
            panic!("two resources expected");
        };
        f.rm.clear_calls();

        f.rm.deliver(vec![allocated(r1)]).await;
        f.rm.deliver(vec![RmChange::lost(r1), RmChange::rejected(r2)])
            .await;

        assert_eq!(f.rm.released(), vec![r2]);
        assert!(f.registry.get_reservation(&id).is_none());
        let events = f.events.lock().clone();
        let_assert!([event] = events.as_slice());
        assert_eq!(event.rejected_reservation_ids, vec![id]);
    }

    #[test(tokio::test)]
    async fn failing_release_after_teardown_is_swallowed() {
        let f = fixture().await;
        let id = ReservationId::new();
        let placed = f
            .registry
            .reserve(id, reservation(HandleId::new(), true))
            .await
            .unwrap();
        f.rm.fail_release(true);

        f.rm.deliver(vec![RmChange::rejected(placed.resources()[0].resource_id())])
            .await;

        assert!(f.registry.get_reservation(&id).is_none());
        assert_eq!(f.events.lock().len(), 1);
    }

    #[test(tokio::test)]
    async fn stopped_by_rm_loses_everything() {
        let f = fixture().await;
        let allocated_id = ReservationId::new();
        let pending_id = ReservationId::new();
        let handle = HandleId::new();
        let placed = f
            .registry
            .reserve(allocated_id, reservation(handle, false))
            .await
            .unwrap();
        f.registry
            .reserve(pending_id, reservation(handle, true))
            .await
            .unwrap();
        let ids = resource_ids(&placed);
        f.rm.deliver(ids.iter().copied().map(allocated).collect())
            .await;
        f.events.lock().clear();
        f.rm.clear_calls();

        f.rm.stop_by_rm().await;

        let events = f.events.lock().clone();
        let_assert!([event] = events.as_slice());
        let mut lost = event.lost_resource_ids.clone();
        lost.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(lost, expected);
        assert_eq!(event.rejected_reservation_ids, vec![pending_id]);
        assert!(f.registry.get_reservation(&pending_id).is_none());
        assert!(f.registry.get_reservation(&allocated_id).is_some());
        // nothing is handed back to a connector which is gone
        assert!(f.rm.calls().is_empty());
    }

    #[test(tokio::test)]
    async fn bulk_releases_are_one_batch() {
        let f = fixture().await;
        let handle = HandleId::new();
        let other = HandleId::new();
        f.registry
            .reserve(ReservationId::new(), reservation(handle, true))
            .await
            .unwrap();
        f.registry
            .reserve(ReservationId::new(), reservation(handle, false))
            .await
            .unwrap();
        f.registry
            .reserve(ReservationId::new(), reservation(other, false))
            .await
            .unwrap();
        assert_eq!(f.registry.get_reservations_for_handle(handle).len(), 2);
        f.rm.clear_calls();

        let released = f
            .registry
            .release_reservations_for_handle(handle, false)
            .await
            .unwrap();
        assert_eq!(released.len(), 2);
        let calls = f.rm.calls();
        let_assert!(
            [ConnectorCall::Release {
                resource_ids,
                do_not_cache: false
            }] = calls.as_slice()
        );
        assert_eq!(resource_ids.len(), 4);

        let released = f
            .registry
            .release_reservations_for_queue(&QueueName::from("q"), true)
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(f.registry.reservation_count(), 0);
    }

    #[test(tokio::test)]
    async fn stop_releases_everything_and_refuses_new_work() {
        let f = fixture().await;
        f.registry
            .reserve(ReservationId::new(), reservation(HandleId::new(), true))
            .await
            .unwrap();
        f.rm.clear_calls();

        f.registry.stop().await.unwrap();

        let calls = f.rm.calls();
        let_assert!(
            [ConnectorCall::Release { do_not_cache: true, .. }, ConnectorCall::Unregister] =
                calls.as_slice()
        );
        assert!(!f.rm.is_registered());
        let_assert!(
            Err(ReservationError::Shutdown) = f
                .registry
                .reserve(ReservationId::new(), reservation(HandleId::new(), true))
                .await
        );
        // stopping twice is fine
        f.registry.stop().await.unwrap();
    }
}
