// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Reservation and resource model.
//!
//! A client submits a [`Reservation`], a set of [`ResourceAsk`]s. Once accepted it is tracked
//! as a [`PlacedReservation`] owning one [`PlacedResource`] per ask. Both carry a status which
//! is driven by the resource manager's change notifications.

use serde::{Deserialize, Serialize};

use crate::identifiers::{HandleId, Location, QueueName, ReservationId, ResourceId, RmResourceId};
use crate::time::MillisSinceEpoch;

/// How strictly the location hint of a [`ResourceAsk`] must be honored.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Locality {
    /// Only the requested location is acceptable.
    Must,
    /// The requested location is preferred, any other is acceptable.
    Preferred,
    #[default]
    DontCare,
}

/// Immutable request for a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAsk {
    /// Client assigned, unique within the reservation.
    pub resource_id: ResourceId,
    pub location: Location,
    pub locality: Locality,
    pub cpu_vcores: u32,
    pub memory_mb: u64,
}

impl ResourceAsk {
    pub fn new(
        location: impl Into<Location>,
        locality: Locality,
        cpu_vcores: u32,
        memory_mb: u64,
    ) -> Self {
        Self {
            resource_id: ResourceId::new(),
            location: location.into(),
            locality,
            cpu_vcores,
            memory_mb,
        }
    }

    pub fn with_resource_id(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = resource_id;
        self
    }
}

/// A client's reservation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub handle: HandleId,
    pub queue: QueueName,
    /// Gang reservations are allocated, or torn down, as a unit.
    pub gang: bool,
    pub resources: Vec<ResourceAsk>,
}

impl Reservation {
    pub fn new(
        handle: HandleId,
        queue: impl Into<QueueName>,
        gang: bool,
        resources: Vec<ResourceAsk>,
    ) -> Self {
        Self {
            handle,
            queue: queue.into(),
            gang,
            resources,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Pending,
    Allocated,
    Rejected,
    Preempted,
    Lost,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Partial,
    Allocated,
    /// Voluntarily released by the anti-deadlock controller, waiting for re-submission.
    BackedOff,
    /// Removed from the broker, either by the client or by a tear down.
    Ended,
}

/// What the resource manager actually handed out for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub cpu_vcores: u32,
    pub memory_mb: u64,
    pub location: Location,
    pub rm_resource_id: RmResourceId,
}

/// Stateful counterpart of a [`ResourceAsk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedResource {
    ask: ResourceAsk,
    reservation_id: ReservationId,
    handle: HandleId,
    queue: QueueName,
    status: ResourceStatus,
    allocation: Option<Allocation>,
}

impl PlacedResource {
    pub fn new(
        ask: ResourceAsk,
        reservation_id: ReservationId,
        handle: HandleId,
        queue: QueueName,
    ) -> Self {
        Self {
            ask,
            reservation_id,
            handle,
            queue,
            status: ResourceStatus::Pending,
            allocation: None,
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        self.ask.resource_id
    }

    pub fn ask(&self) -> &ResourceAsk {
        &self.ask
    }

    pub fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.status == ResourceStatus::Allocated
    }

    pub fn set_allocated(&mut self, allocation: Allocation) {
        self.status = ResourceStatus::Allocated;
        self.allocation = Some(allocation);
    }

    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
    }

    /// Forgets any previous allocation, used when a backed-off reservation is re-submitted.
    pub fn reset(&mut self) {
        self.status = ResourceStatus::Pending;
        self.allocation = None;
    }
}

/// Stateful counterpart of a [`Reservation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedReservation {
    reservation_id: ReservationId,
    handle: HandleId,
    queue: QueueName,
    gang: bool,
    status: ReservationStatus,
    placed_on: MillisSinceEpoch,
    allocated_on: Option<MillisSinceEpoch>,
    resources: Vec<PlacedResource>,
}

impl PlacedReservation {
    /// Places `reservation` with all its resources pending.
    pub fn new(
        reservation_id: ReservationId,
        reservation: Reservation,
        placed_on: MillisSinceEpoch,
    ) -> Self {
        let Reservation {
            handle,
            queue,
            gang,
            resources,
        } = reservation;

        let resources = resources
            .into_iter()
            .map(|ask| PlacedResource::new(ask, reservation_id, handle, queue.clone()))
            .collect();

        Self {
            reservation_id,
            handle,
            queue,
            gang,
            status: ReservationStatus::Pending,
            placed_on,
            allocated_on: None,
            resources,
        }
    }

    pub fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn is_gang(&self) -> bool {
        self.gang
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ReservationStatus) {
        self.status = status;
    }

    /// When the reservation was first placed. Survives backoff and re-submission.
    pub fn placed_on(&self) -> MillisSinceEpoch {
        self.placed_on
    }

    pub fn allocated_on(&self) -> Option<MillisSinceEpoch> {
        self.allocated_on
    }

    pub fn set_allocated_on(&mut self, allocated_on: MillisSinceEpoch) {
        self.allocated_on = Some(allocated_on);
    }

    pub fn resources(&self) -> &[PlacedResource] {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut [PlacedResource] {
        &mut self.resources
    }

    pub fn resource(&self, resource_id: &ResourceId) -> Option<&PlacedResource> {
        self.resources
            .iter()
            .find(|r| r.resource_id() == *resource_id)
    }

    pub fn resource_mut(&mut self, resource_id: &ResourceId) -> Option<&mut PlacedResource> {
        self.resources
            .iter_mut()
            .find(|r| r.resource_id() == *resource_id)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn all_allocated(&self) -> bool {
        self.resources.iter().all(PlacedResource::is_allocated)
    }

    /// Puts the reservation back to its just-placed state, keeping `placed_on`.
    pub fn reset(&mut self) {
        self.status = ReservationStatus::Pending;
        self.allocated_on = None;
        self.resources.iter_mut().for_each(PlacedResource::reset);
    }
}
