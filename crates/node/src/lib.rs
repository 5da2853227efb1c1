// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod queue_broker;

pub use queue_broker::QueueBroker;

/// Registers the descriptions of every metric the broker emits.
pub fn describe_metrics() {
    corral_registry::metric_definitions::describe_metrics();
    corral_resource_cache::metric_definitions::describe_metrics();
    corral_anti_deadlock::metric_definitions::describe_metrics();
}
