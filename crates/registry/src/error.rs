// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashSet;

use corral_rm_connector::ConnectorError;
use corral_types::resources::Reservation;

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("invalid reservation: {0}")]
    InvalidReservation(String),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("reservation broker has been shut down")]
    Shutdown,
}

/// Checks the asks of a reservation before it is placed.
pub fn validate_reservation(reservation: &Reservation) -> Result<(), ReservationError> {
    if reservation.resources.is_empty() {
        return Err(ReservationError::InvalidReservation(
            "a reservation must ask for at least one resource".to_owned(),
        ));
    }

    let mut seen = HashSet::with_capacity(reservation.resources.len());
    for ask in &reservation.resources {
        if !seen.insert(ask.resource_id) {
            return Err(ReservationError::InvalidReservation(format!(
                "resource id '{}' is used more than once",
                ask.resource_id
            )));
        }
        if ask.cpu_vcores == 0 && ask.memory_mb == 0 {
            return Err(ReservationError::InvalidReservation(format!(
                "resource '{}' asks for neither cpu nor memory",
                ask.resource_id
            )));
        }
    }
    Ok(())
}
