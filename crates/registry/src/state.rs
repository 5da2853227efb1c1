// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use corral_types::changes::RmChange;
use corral_types::events::ReservationEvent;
use corral_types::identifiers::{HandleId, ReservationId, ResourceId};
use corral_types::resources::{
    PlacedReservation, PlacedResource, ReservationStatus, ResourceStatus,
};
use corral_types::time::MillisSinceEpoch;

use crate::error::ReservationError;

/// Events of one batch, one per handle, in order of first appearance.
#[derive(Debug, Default)]
struct EventAccumulator {
    events: Vec<ReservationEvent>,
    by_handle: HashMap<HandleId, usize>,
}

impl EventAccumulator {
    fn for_handle(&mut self, handle: HandleId) -> &mut ReservationEvent {
        let idx = *self.by_handle.entry(handle).or_insert_with(|| {
            self.events.push(ReservationEvent::new(handle));
            self.events.len() - 1
        });
        &mut self.events[idx]
    }
}

/// Outcome of applying a batch of changes.
#[derive(Debug, Default)]
pub(crate) struct Reconciliation {
    /// Non-empty events, at most one per handle.
    pub events: Vec<ReservationEvent>,
    /// Resources of torn-down reservations, to be given back to the resource manager.
    pub to_release: Vec<PlacedResource>,
    pub applied: u64,
    pub ignored: u64,
    pub torn_down: u64,
}

enum Effect {
    /// Report the resource in the handle's event. The reservation is left untouched.
    Report,
    /// Remove the reservation and release the other resources.
    TearDown { report_resource: bool },
    Illegal,
}

/// Reservations of one queue, and the index from resource to owning reservation.
#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    reservations: HashMap<ReservationId, PlacedReservation>,
    resource_index: HashMap<ResourceId, ReservationId>,
}

impl RegistryState {
    pub fn insert(&mut self, reservation: PlacedReservation) -> Result<(), ReservationError> {
        let reservation_id = reservation.reservation_id();
        if self.reservations.contains_key(&reservation_id) {
            return Err(ReservationError::InvalidReservation(format!(
                "reservation '{reservation_id}' already exists"
            )));
        }
        if let Some(resource) = reservation
            .resources()
            .iter()
            .find(|r| self.resource_index.contains_key(&r.resource_id()))
        {
            return Err(ReservationError::InvalidReservation(format!(
                "resource '{}' is already placed",
                resource.resource_id()
            )));
        }

        for resource in reservation.resources() {
            self.resource_index
                .insert(resource.resource_id(), reservation_id);
        }
        self.reservations.insert(reservation_id, reservation);
        Ok(())
    }

    pub fn get(&self, reservation_id: &ReservationId) -> Option<&PlacedReservation> {
        self.reservations.get(reservation_id)
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn remove(&mut self, reservation_id: &ReservationId) -> Option<PlacedReservation> {
        let mut reservation = self.reservations.remove(reservation_id)?;
        for resource in reservation.resources() {
            self.resource_index.remove(&resource.resource_id());
        }
        reservation.set_status(ReservationStatus::Ended);
        Some(reservation)
    }

    pub fn remove_where(
        &mut self,
        mut predicate: impl FnMut(&PlacedReservation) -> bool,
    ) -> Vec<PlacedReservation> {
        let ids: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|reservation| predicate(reservation))
            .map(PlacedReservation::reservation_id)
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn filter(
        &self,
        mut predicate: impl FnMut(&PlacedReservation) -> bool,
    ) -> Vec<PlacedReservation> {
        self.reservations
            .values()
            .filter(|reservation| predicate(reservation))
            .cloned()
            .collect()
    }

    pub fn resource_ids(&self) -> Vec<ResourceId> {
        self.resource_index.keys().copied().collect()
    }

    /// Applies `changes` in order. Nothing is released or dispatched here; the caller does so
    /// once the lock is dropped.
    pub fn reconcile(&mut self, changes: Vec<RmChange>, now: MillisSinceEpoch) -> Reconciliation {
        let mut events = EventAccumulator::default();
        let mut outcome = Reconciliation::default();

        for change in changes {
            if self.apply(change, now, &mut events, &mut outcome) {
                outcome.applied += 1;
            } else {
                outcome.ignored += 1;
            }
        }

        outcome.events = events
            .events
            .into_iter()
            .filter(|event| !event.is_empty())
            .collect();
        outcome
    }

    fn apply(
        &mut self,
        change: RmChange,
        now: MillisSinceEpoch,
        events: &mut EventAccumulator,
        outcome: &mut Reconciliation,
    ) -> bool {
        let resource_id = change.resource_id();
        let Some(reservation_id) = self.resource_index.get(&resource_id).copied() else {
            warn!(
                %resource_id,
                kind = %change.kind(),
                "Ignoring change about an unknown resource, it was probably released already"
            );
            return false;
        };
        let Some(reservation) = self.reservations.get_mut(&reservation_id) else {
            error!(
                %resource_id,
                %reservation_id,
                "Resource is indexed but its reservation is gone, dropping the index entry"
            );
            self.resource_index.remove(&resource_id);
            return false;
        };

        let handle = reservation.handle();
        let gang = reservation.is_gang();
        let status = reservation.status();

        let allocation = match change {
            RmChange::Allocated { allocation, .. } => allocation,
            negative => {
                let kind = negative.status();
                let effect = match (kind, status) {
                    (ResourceStatus::Rejected, ReservationStatus::Allocated) => Effect::Illegal,
                    (
                        ResourceStatus::Rejected,
                        ReservationStatus::Pending | ReservationStatus::Partial,
                    ) if gang => Effect::TearDown {
                        report_resource: true,
                    },
                    (
                        ResourceStatus::Rejected,
                        ReservationStatus::Pending | ReservationStatus::Partial,
                    ) => Effect::Report,
                    (
                        ResourceStatus::Preempted | ResourceStatus::Lost,
                        ReservationStatus::Allocated,
                    ) => Effect::Report,
                    (ResourceStatus::Preempted | ResourceStatus::Lost, ReservationStatus::Partial)
                        if gang =>
                    {
                        Effect::TearDown {
                            report_resource: false,
                        }
                    }
                    (ResourceStatus::Preempted | ResourceStatus::Lost, ReservationStatus::Partial) => {
                        Effect::Report
                    }
                    (ResourceStatus::Preempted | ResourceStatus::Lost, ReservationStatus::Pending) => {
                        warn!(
                            %resource_id,
                            %reservation_id,
                            %kind,
                            "Resource reported gone before being allocated, tearing the reservation down"
                        );
                        Effect::TearDown {
                            report_resource: false,
                        }
                    }
                    _ => Effect::Illegal,
                };
                return self.apply_negative(
                    effect,
                    kind,
                    reservation_id,
                    resource_id,
                    handle,
                    events,
                    outcome,
                );
            }
        };

        let Some(resource) = reservation.resource_mut(&resource_id) else {
            error!(%resource_id, %reservation_id, "Indexed resource is missing from its reservation");
            return false;
        };
        if resource.is_allocated() {
            warn!(%resource_id, %reservation_id, "Ignoring duplicate allocation");
            return false;
        }
        resource.set_allocated(allocation);
        let resource = resource.clone();

        if reservation.all_allocated() {
            debug!(%reservation_id, %handle, "Reservation allocated");
            reservation.set_status(ReservationStatus::Allocated);
            reservation.set_allocated_on(now);
            let event = events.for_handle(handle);
            event.allocated_reservation_ids.push(reservation_id);
            if gang {
                event
                    .allocated_resources
                    .extend(reservation.resources().iter().cloned());
            } else {
                event.allocated_resources.push(resource);
            }
        } else {
            reservation.set_status(ReservationStatus::Partial);
            // gang reservations report nothing until complete
            if !gang {
                events.for_handle(handle).allocated_resources.push(resource);
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_negative(
        &mut self,
        effect: Effect,
        kind: ResourceStatus,
        reservation_id: ReservationId,
        resource_id: ResourceId,
        handle: HandleId,
        events: &mut EventAccumulator,
        outcome: &mut Reconciliation,
    ) -> bool {
        match effect {
            Effect::Illegal => {
                warn!(
                    %resource_id,
                    %reservation_id,
                    %kind,
                    "Ignoring change which is illegal in the current reservation state"
                );
                false
            }
            Effect::Report => {
                let event = events.for_handle(handle);
                match kind {
                    ResourceStatus::Rejected => event.rejected_resource_ids.push(resource_id),
                    ResourceStatus::Preempted => event.preempted_resource_ids.push(resource_id),
                    _ => event.lost_resource_ids.push(resource_id),
                }
                true
            }
            Effect::TearDown { report_resource } => {
                let Some(mut reservation) = self.remove(&reservation_id) else {
                    return false;
                };
                debug!(%reservation_id, %handle, %kind, "Tearing down gang reservation");
                if let Some(resource) = reservation.resource_mut(&resource_id) {
                    resource.set_status(kind);
                }
                outcome.to_release.extend(
                    reservation
                        .resources()
                        .iter()
                        .filter(|r| r.resource_id() != resource_id)
                        .cloned(),
                );
                outcome.torn_down += 1;

                let event = events.for_handle(handle);
                event.rejected_reservation_ids.push(reservation_id);
                if report_resource {
                    event.rejected_resource_ids.push(resource_id);
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use corral_test_util::{assert, assert_eq, let_assert};
    use corral_types::resources::{Allocation, Locality, Reservation, ResourceAsk};

    const NOW: MillisSinceEpoch = MillisSinceEpoch::new(1_000);

    fn two_resources(gang: bool) -> (PlacedReservation, ResourceId, ResourceId) {
        let first = ResourceAsk::new("l1", Locality::DontCare, 1, 1024);
        let second = ResourceAsk::new("l2", Locality::DontCare, 2, 2048);
        let ids = (first.resource_id, second.resource_id);
        let reservation = Reservation::new(HandleId::new(), "q", gang, vec![first, second]);
        (
            PlacedReservation::new(ReservationId::new(), reservation, NOW),
            ids.0,
            ids.1,
        )
    }

    fn allocated(resource_id: ResourceId, cpu_vcores: u32, memory_mb: u64) -> RmChange {
        RmChange::allocated(
            resource_id,
            Allocation {
                cpu_vcores,
                memory_mb,
                location: "l1".into(),
                rm_resource_id: format!("rm-{resource_id}").into(),
            },
        )
    }

    fn state_with(reservation: &PlacedReservation) -> RegistryState {
        let mut state = RegistryState::default();
        state.insert(reservation.clone()).unwrap();
        state
    }

    #[test]
    fn non_gang_reports_resources_individually() {
        let (reservation, r1, r2) = two_resources(false);
        let id = reservation.reservation_id();
        let mut state = state_with(&reservation);

        let outcome = state.reconcile(vec![allocated(r1, 1, 1024)], NOW);
        let_assert!([event] = outcome.events.as_slice());
        assert_eq!(event.allocated_resources.len(), 1);
        assert!(event.allocated_reservation_ids.is_empty());
        assert_eq!(state.get(&id).unwrap().status(), ReservationStatus::Partial);

        let outcome = state.reconcile(vec![allocated(r2, 2, 2048)], NOW);
        let_assert!([event] = outcome.events.as_slice());
        assert_eq!(event.allocated_resources.len(), 1);
        assert_eq!(event.allocated_reservation_ids, vec![id]);
        assert_eq!(state.get(&id).unwrap().status(), ReservationStatus::Allocated);
        assert_eq!(state.get(&id).unwrap().allocated_on(), Some(NOW));
    }

    #[test]
    fn gang_reports_nothing_until_complete() {
        let (reservation, r1, r2) = two_resources(true);
        let id = reservation.reservation_id();
        let mut state = state_with(&reservation);

        let outcome = state.reconcile(vec![allocated(r1, 1, 1024)], NOW);
        assert!(outcome.events.is_empty());
        assert_eq!(state.get(&id).unwrap().status(), ReservationStatus::Partial);

        let outcome = state.reconcile(vec![allocated(r2, 2, 2048)], NOW);
        let_assert!([event] = outcome.events.as_slice());
        assert_eq!(event.allocated_resources.len(), 2);
        assert_eq!(event.allocated_reservation_ids, vec![id]);
        assert_eq!(state.get(&id).unwrap().status(), ReservationStatus::Allocated);
    }

    #[test]
    fn gang_rejection_tears_down_and_releases_siblings_once() {
        let (reservation, r1, r2) = two_resources(true);
        let id = reservation.reservation_id();
        let mut state = state_with(&reservation);

        let outcome = state.reconcile(
            vec![allocated(r1, 1, 1024), RmChange::rejected(r2), RmChange::rejected(r1)],
            NOW,
        );

        assert!(state.get(&id).is_none());
        assert!(state.resource_ids().is_empty());
        let_assert!([released] = outcome.to_release.as_slice());
        assert_eq!(released.resource_id(), r1);
        let_assert!([event] = outcome.events.as_slice());
        assert_eq!(event.rejected_reservation_ids, vec![id]);
        assert_eq!(event.rejected_resource_ids, vec![r2]);
        // the late rejection of r1 is about a resource that is gone already
        assert_eq!(outcome.ignored, 1);
        assert_eq!(outcome.torn_down, 1);
    }

    #[test]
    fn non_gang_negative_changes_leave_reservation_in_place() {
        let (reservation, r1, r2) = two_resources(false);
        let id = reservation.reservation_id();
        let mut state = state_with(&reservation);

        let outcome = state.reconcile(
            vec![allocated(r1, 1, 1024), RmChange::rejected(r2)],
            NOW,
        );
        let_assert!([event] = outcome.events.as_slice());
        assert_eq!(event.rejected_resource_ids, vec![r2]);
        assert!(outcome.to_release.is_empty());

        let outcome = state.reconcile(vec![RmChange::preempted(r1), RmChange::lost(r1)], NOW);
        let_assert!([event] = outcome.events.as_slice());
        assert_eq!(event.preempted_resource_ids, vec![r1]);
        assert_eq!(event.lost_resource_ids, vec![r1]);
        assert_eq!(state.get(&id).unwrap().status(), ReservationStatus::Partial);
    }

    #[test]
    fn gang_partial_preemption_and_loss_tear_down() {
        for change in [RmChange::preempted, RmChange::lost] {
            let (reservation, r1, r2) = two_resources(true);
            let id = reservation.reservation_id();
            let mut state = state_with(&reservation);
            state.reconcile(vec![allocated(r1, 1, 1024)], NOW);

            let outcome = state.reconcile(vec![change(r1)], NOW);

            assert!(state.get(&id).is_none());
            let_assert!([released] = outcome.to_release.as_slice());
            assert_eq!(released.resource_id(), r2);
            let_assert!([event] = outcome.events.as_slice());
            assert_eq!(event.rejected_reservation_ids, vec![id]);
            assert!(event.preempted_resource_ids.is_empty());
            assert!(event.lost_resource_ids.is_empty());
        }
    }

    #[test]
    fn pending_preemption_or_loss_tears_down_defensively() {
        for change in [RmChange::preempted, RmChange::lost] {
            for gang in [true, false] {
                let (reservation, r1, r2) = two_resources(gang);
                let id = reservation.reservation_id();
                let mut state = state_with(&reservation);

                let outcome = state.reconcile(vec![change(r1)], NOW);

                assert!(state.get(&id).is_none());
                let_assert!([released] = outcome.to_release.as_slice());
                assert_eq!(released.resource_id(), r2);
                let_assert!([event] = outcome.events.as_slice());
                assert_eq!(event.rejected_reservation_ids, vec![id]);
            }
        }
    }

    #[test]
    fn allocated_reservation_survives_negative_changes() {
        let (reservation, r1, r2) = two_resources(true);
        let id = reservation.reservation_id();
        let mut state = state_with(&reservation);
        state.reconcile(vec![allocated(r1, 1, 1024), allocated(r2, 2, 2048)], NOW);

        let outcome = state.reconcile(
            vec![
                RmChange::rejected(r1),
                RmChange::preempted(r1),
                RmChange::lost(r2),
            ],
            NOW,
        );

        assert_eq!(outcome.ignored, 1);
        let_assert!([event] = outcome.events.as_slice());
        assert!(event.rejected_resource_ids.is_empty());
        assert_eq!(event.preempted_resource_ids, vec![r1]);
        assert_eq!(event.lost_resource_ids, vec![r2]);

        let reservation = state.get(&id).unwrap();
        assert_eq!(reservation.status(), ReservationStatus::Allocated);
        assert!(reservation.all_allocated());
    }

    #[test]
    fn unknown_and_duplicate_changes_are_ignored() {
        let (reservation, r1, _) = two_resources(false);
        let mut state = state_with(&reservation);

        let outcome = state.reconcile(
            vec![
                RmChange::lost(ResourceId::new()),
                allocated(r1, 1, 1024),
                allocated(r1, 1, 1024),
            ],
            NOW,
        );
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.ignored, 2);
    }

    #[test]
    fn events_are_grouped_per_handle() {
        let (first, a1, _) = two_resources(false);
        let (second, b1, _) = two_resources(false);
        let mut state = state_with(&first);
        state.insert(second.clone()).unwrap();

        let outcome = state.reconcile(
            vec![allocated(a1, 1, 1024), allocated(b1, 1, 1024), RmChange::lost(a1)],
            NOW,
        );

        let_assert!([for_first, for_second] = outcome.events.as_slice());
        assert_eq!(for_first.handle, first.handle());
        assert_eq!(for_first.allocated_resources.len(), 1);
        assert_eq!(for_first.lost_resource_ids, vec![a1]);
        assert_eq!(for_second.handle, second.handle());
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let (reservation, _, _) = two_resources(false);
        let mut state = state_with(&reservation);
        let_assert!(
            Err(ReservationError::InvalidReservation(_)) = state.insert(reservation.clone())
        );
        assert_eq!(state.len(), 1);
    }
}
