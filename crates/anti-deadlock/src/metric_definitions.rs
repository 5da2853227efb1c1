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

pub const BACKOFF_ROUNDS: &str = "corral.anti_deadlock.backoff_rounds.total";
pub const RESERVATIONS_BACKED_OFF: &str = "corral.anti_deadlock.backed_off.total";
pub const RESUBMISSIONS: &str = "corral.anti_deadlock.resubmissions.total";
pub const RESUBMISSION_FAILURES: &str = "corral.anti_deadlock.resubmission_failures.total";
pub const BACKOFF_QUEUE_SIZE: &str = "corral.anti_deadlock.backoff_queue_size";

pub fn describe_metrics() {
    describe_counter!(
        BACKOFF_ROUNDS,
        Unit::Count,
        "Number of backoff rounds started because gang scheduling stalled"
    );
    describe_counter!(
        RESERVATIONS_BACKED_OFF,
        Unit::Count,
        "Number of gang reservations put into the backoff queue"
    );
    describe_counter!(
        RESUBMISSIONS,
        Unit::Count,
        "Number of backed-off reservations submitted again"
    );
    describe_counter!(
        RESUBMISSION_FAILURES,
        Unit::Count,
        "Number of backed-off reservations rejected because they could not be submitted again"
    );
    describe_gauge!(
        BACKOFF_QUEUE_SIZE,
        Unit::Count,
        "Number of reservations waiting in the backoff queue"
    );
}
