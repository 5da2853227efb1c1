// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_registry::{
    ListenerId, Listeners, ReservationBroker, ReservationError, ReservationListener,
    ReservationRegistry, validate_reservation,
};
use corral_rm_connector::NodeDescriptor;
use corral_timer_queue::DelayQueue;
use corral_types::Clock;
use corral_types::config::AntiDeadlockOptions;
use corral_types::events::ReservationEvent;
use corral_types::identifiers::{HandleId, QueueName, ReservationId};
use corral_types::resources::{PlacedReservation, Reservation, ReservationStatus};
use corral_types::time::MillisSinceEpoch;

use crate::metric_definitions::{
    BACKOFF_QUEUE_SIZE, BACKOFF_ROUNDS, RESERVATIONS_BACKED_OFF, RESUBMISSION_FAILURES,
    RESUBMISSIONS,
};

struct ControllerState {
    /// Gang reservations which are neither allocated nor rejected yet.
    local: HashMap<ReservationId, PlacedReservation>,
    /// Those of `local` currently submitted to the registry.
    submitted: HashSet<ReservationId>,
    backoff: DelayQueue<ReservationId>,
    last_allocation: MillisSinceEpoch,
}

impl ControllerState {
    fn forget(&mut self, reservation_id: &ReservationId) -> Option<PlacedReservation> {
        self.submitted.remove(reservation_id);
        let removed = self.local.remove(reservation_id)?;
        if removed.status() == ReservationStatus::BackedOff {
            self.backoff.retain(|id| id != reservation_id);
            gauge!(BACKOFF_QUEUE_SIZE).set(self.backoff.len() as f64);
        }
        Some(removed)
    }

    fn forget_where(
        &mut self,
        mut predicate: impl FnMut(&PlacedReservation) -> bool,
    ) -> Vec<PlacedReservation> {
        let ids: Vec<_> = self
            .local
            .values()
            .filter(|reservation| predicate(reservation))
            .map(PlacedReservation::reservation_id)
            .collect();
        ids.iter().filter_map(|id| self.forget(id)).collect()
    }
}

/// Breaks resource-holding cycles between gang reservations.
///
/// Wraps a [`ReservationRegistry`]. Whenever no submitted gang reservation made progress for
/// `no-allocation-limit`, a share of them is released and queued for re-submission after a
/// random delay, giving the remaining ones a chance to complete. Non-gang reservations are
/// passed through untouched.
pub struct GangAntiDeadlockBroker {
    registry: Arc<ReservationRegistry>,
    clock: Arc<dyn Clock>,
    options: AntiDeadlockOptions,
    state: Mutex<ControllerState>,
    listeners: Listeners,
}

impl GangAntiDeadlockBroker {
    /// Creates the controller and subscribes it to the registry's events.
    pub fn new(
        registry: Arc<ReservationRegistry>,
        clock: Arc<dyn Clock>,
        options: AntiDeadlockOptions,
    ) -> Arc<Self> {
        let now = clock.now();
        let broker = Arc::new(Self {
            registry: Arc::clone(&registry),
            clock,
            options,
            state: Mutex::new(ControllerState {
                local: HashMap::new(),
                submitted: HashSet::new(),
                backoff: DelayQueue::new(),
                last_allocation: now,
            }),
            listeners: Listeners::default(),
        });
        registry.add_listener(Arc::new(EventTap(Arc::downgrade(&broker))));
        broker
    }

    /// Runs the control loop until `cancellation` fires.
    pub async fn run(self: Arc<Self>, cancellation: CancellationToken) {
        info!(
            queue = %self.registry.queue(),
            no_allocation_limit = %self.options.no_allocation_limit,
            backoff_percent = self.options.backoff_percent,
            "Gang anti-deadlock controller started"
        );
        loop {
            let sleep = self.run_once().await;
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        debug!("Gang anti-deadlock controller stopped");
    }

    /// One iteration of the control loop. Returns how long to sleep until the next one.
    pub async fn run_once(&self) -> Duration {
        let sleep = self.deadlock_avoidance(self.clock.now()).await;
        match self.re_reserve_backoffs(self.clock.now()).await {
            Some(next) => sleep.min(next),
            None => sleep,
        }
    }

    /// Starts a backoff round if nothing got allocated for `no-allocation-limit`. Returns the
    /// time left until the limit is reached again.
    pub async fn deadlock_avoidance(&self, now: MillisSinceEpoch) -> Duration {
        let limit = self.options.no_allocation_limit();
        let elapsed = now.saturating_duration_since(self.state.lock().last_allocation);
        if elapsed < limit {
            return limit - elapsed;
        }
        self.back_off_round(now).await;
        limit
    }

    /// Re-submits the backed-off reservations whose delay elapsed. Returns the time until the
    /// next one is due, if any.
    pub async fn re_reserve_backoffs(&self, now: MillisSinceEpoch) -> Option<Duration> {
        let due: Vec<PlacedReservation> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let ids = state.backoff.drain_expired(now);
            gauge!(BACKOFF_QUEUE_SIZE).set(state.backoff.len() as f64);
            ids.into_iter()
                .filter_map(|id| {
                    // released by its client while backed off
                    let reservation = state.local.get_mut(&id)?;
                    reservation.reset();
                    state.submitted.insert(id);
                    Some(reservation.clone())
                })
                .collect()
        };

        for reservation in due {
            let reservation_id = reservation.reservation_id();
            let handle = reservation.handle();
            match self.registry.place(reservation).await {
                Ok(_) => {
                    counter!(RESUBMISSIONS).increment(1);
                    debug!(%reservation_id, %handle, "Re-submitted backed-off reservation");
                }
                Err(err) => {
                    counter!(RESUBMISSION_FAILURES).increment(1);
                    warn!(
                        %err,
                        %reservation_id,
                        %handle,
                        "Failed to re-submit backed-off reservation, rejecting it"
                    );
                    self.state.lock().forget(&reservation_id);
                    self.listeners
                        .dispatch([ReservationEvent::rejection(handle, reservation_id)]);
                }
            }
        }

        self.state
            .lock()
            .backoff
            .time_until_next(self.clock.now())
    }

    async fn back_off_round(&self, now: MillisSinceEpoch) {
        let victims = self.pick_victims();
        if !victims.is_empty() {
            counter!(BACKOFF_ROUNDS).increment(1);
            info!(
                queue = %self.registry.queue(),
                no_allocation_limit = %self.options.no_allocation_limit,
                "Gang scheduling stalled, backing off {} reservations",
                victims.len()
            );
        }

        for (reservation_id, handle) in victims {
            if let Err(err) = self
                .registry
                .release_reservation(handle, reservation_id, false)
                .await
            {
                // the registry forgot it already, so it can still be re-submitted later
                warn!(%err, %reservation_id, "Failed to release reservation while backing off");
            }

            let delay = self.random_delay();
            let mut state = self.state.lock();
            let Some(reservation) = state.local.get_mut(&reservation_id) else {
                continue;
            };
            reservation.reset();
            reservation.set_status(ReservationStatus::BackedOff);
            state.backoff.sleep_until(now + delay, reservation_id);
            gauge!(BACKOFF_QUEUE_SIZE).set(state.backoff.len() as f64);
            counter!(RESERVATIONS_BACKED_OFF).increment(1);
            debug!(%reservation_id, %handle, ?delay, "Reservation backed off");
        }

        self.state.lock().last_allocation = self.clock.now();
    }

    /// Takes random submitted reservations out of the submitted set until they add up to
    /// `backoff-percent` of the submitted resources.
    fn pick_victims(&self) -> Vec<(ReservationId, HandleId)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let total: usize = state
            .submitted
            .iter()
            .filter_map(|id| state.local.get(id))
            .map(PlacedReservation::resource_count)
            .sum();
        let target = total * usize::from(self.options.backoff_percent) / 100;

        let mut rng = rand::rng();
        let mut removed = 0;
        let mut victims = Vec::new();
        while removed < target && !state.submitted.is_empty() {
            let idx = rng.random_range(0..state.submitted.len());
            let Some(id) = state.submitted.iter().nth(idx).copied() else {
                break;
            };
            state.submitted.remove(&id);
            let Some(reservation) = state.local.get_mut(&id) else {
                continue;
            };
            reservation.set_status(ReservationStatus::BackedOff);
            removed += reservation.resource_count();
            victims.push((id, reservation.handle()));
        }
        victims
    }

    fn random_delay(&self) -> Duration {
        let min = self.options.backoff_min_delay();
        let max = self.options.backoff_max_delay();
        if min >= max {
            return min;
        }
        rand::rng().random_range(min..max)
    }

    fn on_registry_event(&self, event: &ReservationEvent) {
        {
            let mut state = self.state.lock();
            if event
                .allocated_resources
                .iter()
                .any(|r| state.submitted.contains(&r.reservation_id()))
            {
                state.last_allocation = self.clock.now();
            }
            for id in event
                .allocated_reservation_ids
                .iter()
                .chain(&event.rejected_reservation_ids)
            {
                state.forget(id);
            }
        }
        self.listeners.dispatch([event.clone()]);
    }

    pub fn tracked_count(&self) -> usize {
        self.state.lock().local.len()
    }

    pub fn submitted_count(&self) -> usize {
        self.state.lock().submitted.len()
    }

    pub fn backed_off_count(&self) -> usize {
        self.state.lock().backoff.len()
    }

    pub fn is_submitted(&self, reservation_id: &ReservationId) -> bool {
        self.state.lock().submitted.contains(reservation_id)
    }

    fn merge_released(
        mut released: Vec<PlacedReservation>,
        forgotten: Vec<PlacedReservation>,
    ) -> Vec<PlacedReservation> {
        let mut seen: HashSet<_> = released
            .iter()
            .map(PlacedReservation::reservation_id)
            .collect();
        for mut reservation in forgotten {
            if seen.insert(reservation.reservation_id()) {
                reservation.set_status(ReservationStatus::Ended);
                released.push(reservation);
            }
        }
        released
    }
}

/// Holds the controller weakly, the registry must not keep it alive.
struct EventTap(Weak<GangAntiDeadlockBroker>);

impl ReservationListener for EventTap {
    fn on_event(&self, event: &ReservationEvent) {
        if let Some(broker) = self.0.upgrade() {
            broker.on_registry_event(event);
        }
    }
}

#[async_trait]
impl ReservationBroker for GangAntiDeadlockBroker {
    async fn reserve(
        &self,
        reservation_id: ReservationId,
        reservation: Reservation,
    ) -> Result<PlacedReservation, ReservationError> {
        if !reservation.gang {
            return self.registry.reserve(reservation_id, reservation).await;
        }
        validate_reservation(&reservation)?;

        let now = self.clock.now();
        let mut placed = PlacedReservation::new(reservation_id, reservation, now);
        {
            let mut state = self.state.lock();
            if state.local.contains_key(&reservation_id) {
                return Err(ReservationError::InvalidReservation(format!(
                    "reservation '{reservation_id}' already exists"
                )));
            }
            if !state.backoff.is_empty() {
                // don't compete with reservations waiting for their second chance
                placed.set_status(ReservationStatus::BackedOff);
                let delay = self.random_delay();
                state.backoff.sleep_until(now + delay, reservation_id);
                state.local.insert(reservation_id, placed.clone());
                gauge!(BACKOFF_QUEUE_SIZE).set(state.backoff.len() as f64);
                counter!(RESERVATIONS_BACKED_OFF).increment(1);
                debug!(%reservation_id, ?delay, "Backoff in progress, queueing new gang reservation");
                return Ok(placed);
            }
            state.local.insert(reservation_id, placed.clone());
            state.submitted.insert(reservation_id);
        }

        match self.registry.place(placed).await {
            Ok(placed) => Ok(placed),
            Err(err) => {
                self.state.lock().forget(&reservation_id);
                Err(err)
            }
        }
    }

    fn get_reservation(&self, reservation_id: &ReservationId) -> Option<PlacedReservation> {
        let backed_off = self
            .state
            .lock()
            .local
            .get(reservation_id)
            .filter(|r| r.status() == ReservationStatus::BackedOff)
            .cloned();
        backed_off.or_else(|| self.registry.get_reservation(reservation_id))
    }

    async fn release_reservation(
        &self,
        handle: HandleId,
        reservation_id: ReservationId,
        do_not_cache: bool,
    ) -> Result<Option<PlacedReservation>, ReservationError> {
        let forgotten = {
            let mut state = self.state.lock();
            match state.local.get(&reservation_id) {
                Some(reservation) if reservation.handle() == handle => {
                    state.forget(&reservation_id)
                }
                _ => None,
            }
        };

        let released = self
            .registry
            .release_reservation(handle, reservation_id, do_not_cache)
            .await?;
        Ok(released.or_else(|| {
            forgotten.map(|mut reservation| {
                reservation.set_status(ReservationStatus::Ended);
                reservation
            })
        }))
    }

    async fn release_reservations_for_handle(
        &self,
        handle: HandleId,
        do_not_cache: bool,
    ) -> Result<Vec<PlacedReservation>, ReservationError> {
        let forgotten = self.state.lock().forget_where(|r| r.handle() == handle);
        let released = self
            .registry
            .release_reservations_for_handle(handle, do_not_cache)
            .await?;
        Ok(Self::merge_released(released, forgotten))
    }

    async fn release_reservations_for_queue(
        &self,
        queue: &QueueName,
        do_not_cache: bool,
    ) -> Result<Vec<PlacedReservation>, ReservationError> {
        let forgotten = self.state.lock().forget_where(|r| r.queue() == queue);
        let released = self
            .registry
            .release_reservations_for_queue(queue, do_not_cache)
            .await?;
        Ok(Self::merge_released(released, forgotten))
    }

    fn add_listener(&self, listener: Arc<dyn ReservationListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, listener_id: ListenerId) -> bool {
        self.listeners.remove(listener_id)
    }

    async fn get_nodes(&self) -> Result<Vec<NodeDescriptor>, ReservationError> {
        self.registry.get_nodes().await
    }
}
