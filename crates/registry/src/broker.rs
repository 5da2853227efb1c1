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

use async_trait::async_trait;

use corral_rm_connector::NodeDescriptor;
use corral_types::identifiers::{HandleId, QueueName, ReservationId};
use corral_types::resources::{PlacedReservation, Reservation};

use crate::error::ReservationError;
use crate::listener::{ListenerId, ReservationListener};

/// What the routing layer sees of a queue: implemented by the registry and by the wrappers
/// stacked on top of it.
#[async_trait]
pub trait ReservationBroker: Send + Sync + 'static {
    async fn reserve(
        &self,
        reservation_id: ReservationId,
        reservation: Reservation,
    ) -> Result<PlacedReservation, ReservationError>;

    fn get_reservation(&self, reservation_id: &ReservationId) -> Option<PlacedReservation>;

    /// Releases one reservation. Unknown ids are not an error: `Ok(None)` is returned.
    async fn release_reservation(
        &self,
        handle: HandleId,
        reservation_id: ReservationId,
        do_not_cache: bool,
    ) -> Result<Option<PlacedReservation>, ReservationError>;

    async fn release_reservations_for_handle(
        &self,
        handle: HandleId,
        do_not_cache: bool,
    ) -> Result<Vec<PlacedReservation>, ReservationError>;

    async fn release_reservations_for_queue(
        &self,
        queue: &QueueName,
        do_not_cache: bool,
    ) -> Result<Vec<PlacedReservation>, ReservationError>;

    fn add_listener(&self, listener: Arc<dyn ReservationListener>) -> ListenerId;

    fn remove_listener(&self, listener_id: ListenerId) -> bool;

    async fn get_nodes(&self) -> Result<Vec<NodeDescriptor>, ReservationError>;
}
