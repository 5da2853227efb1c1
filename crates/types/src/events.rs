// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

use crate::identifiers::{HandleId, ReservationId, ResourceId};
use crate::resources::PlacedResource;

/// Everything a handle needs to learn from one batch of resource manager notifications.
///
/// One event is accumulated per owning handle per batch. Empty events are never dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationEvent {
    pub handle: HandleId,
    pub allocated_resources: Vec<PlacedResource>,
    pub allocated_reservation_ids: Vec<ReservationId>,
    pub rejected_reservation_ids: Vec<ReservationId>,
    pub rejected_resource_ids: Vec<ResourceId>,
    pub preempted_resource_ids: Vec<ResourceId>,
    pub lost_resource_ids: Vec<ResourceId>,
}

impl ReservationEvent {
    pub fn new(handle: HandleId) -> Self {
        Self {
            handle,
            allocated_resources: Vec::new(),
            allocated_reservation_ids: Vec::new(),
            rejected_reservation_ids: Vec::new(),
            rejected_resource_ids: Vec::new(),
            preempted_resource_ids: Vec::new(),
            lost_resource_ids: Vec::new(),
        }
    }

    /// An event carrying just the rejection of `reservation_id`.
    pub fn rejection(handle: HandleId, reservation_id: ReservationId) -> Self {
        let mut event = Self::new(handle);
        event.rejected_reservation_ids.push(reservation_id);
        event
    }

    pub fn is_empty(&self) -> bool {
        self.allocated_resources.is_empty()
            && self.allocated_reservation_ids.is_empty()
            && self.rejected_reservation_ids.is_empty()
            && self.rejected_resource_ids.is_empty()
            && self.preempted_resource_ids.is_empty()
            && self.lost_resource_ids.is_empty()
    }
}
