// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Capacity-indexed cache of released resources, and the connector wrapper that serves asks
//! from it.

mod cache;
mod connector;
mod eviction;
pub mod metric_definitions;

pub use cache::{CacheEntry, CacheHit, CacheStats, HitKind, ResourceCache};
pub use connector::CachingRmConnector;
pub use eviction::{
    EvictionPolicy, IdleTimeoutEvictionPolicy, NeverEvictPolicy, policy_from_options,
};
