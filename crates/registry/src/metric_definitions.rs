// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_gauge};

pub const RESERVATIONS_PLACED: &str = "corral.registry.reservations_placed.total";
pub const RESERVATIONS_RELEASED: &str = "corral.registry.reservations_released.total";
pub const RESERVATIONS_TORN_DOWN: &str = "corral.registry.reservations_torn_down.total";
pub const RESERVATIONS_ACTIVE: &str = "corral.registry.reservations_active";

pub const CHANGES_APPLIED: &str = "corral.registry.changes_applied.total";
pub const CHANGES_IGNORED: &str = "corral.registry.changes_ignored.total";

pub const EVENTS_DISPATCHED: &str = "corral.registry.events_dispatched.total";
pub const LISTENER_PANICS: &str = "corral.registry.listener_panics.total";

pub fn describe_metrics() {
    describe_counter!(
        RESERVATIONS_PLACED,
        Unit::Count,
        "Number of reservations submitted to the resource manager"
    );
    describe_counter!(
        RESERVATIONS_RELEASED,
        Unit::Count,
        "Number of reservations released by their clients"
    );
    describe_counter!(
        RESERVATIONS_TORN_DOWN,
        Unit::Count,
        "Number of gang reservations torn down after a rejection, preemption or loss"
    );
    describe_gauge!(
        RESERVATIONS_ACTIVE,
        Unit::Count,
        "Number of reservations tracked by the registry"
    );
    describe_counter!(
        CHANGES_APPLIED,
        Unit::Count,
        "Number of resource manager changes applied to the registry"
    );
    describe_counter!(
        CHANGES_IGNORED,
        Unit::Count,
        "Number of resource manager changes about unknown resources or in illegal states"
    );
    describe_counter!(
        EVENTS_DISPATCHED,
        Unit::Count,
        "Number of non-empty events handed to listeners"
    );
    describe_counter!(
        LISTENER_PANICS,
        Unit::Count,
        "Number of listener invocations that panicked"
    );
}
