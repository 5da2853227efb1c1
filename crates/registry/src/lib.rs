// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-queue reservation registry.
//!
//! A [`ReservationRegistry`] owns the placed reservations of one queue. Clients reserve and
//! release through the [`ReservationBroker`] interface; the resource manager reports back through
//! [`corral_rm_connector::RmEventHandler`], and the outcome is handed to the registered
//! [`ReservationListener`]s as one [`ReservationEvent`](corral_types::events::ReservationEvent)
//! per handle and batch.

mod broker;
mod error;
mod listener;
pub mod metric_definitions;
mod registry;
mod state;

pub use broker::ReservationBroker;
pub use error::{ReservationError, validate_reservation};
pub use listener::{ListenerId, Listeners, ReservationListener};
pub use registry::ReservationRegistry;
