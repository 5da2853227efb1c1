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

pub const CACHE_HIT: &str = "corral.resource_cache.hit.total";
pub const CACHE_MISS: &str = "corral.resource_cache.miss.total";
pub const CACHE_INSERTED: &str = "corral.resource_cache.inserted.total";
pub const CACHE_EVICTED: &str = "corral.resource_cache.evicted.total";
/// Entries dropped because the resource manager reported about them while cached
pub const CACHE_INVALIDATED: &str = "corral.resource_cache.invalidated.total";
pub const CACHE_SIZE: &str = "corral.resource_cache.size";

pub fn describe_metrics() {
    describe_counter!(
        CACHE_HIT,
        Unit::Count,
        "Number of asks satisfied from the resource cache"
    );
    describe_counter!(
        CACHE_MISS,
        Unit::Count,
        "Number of asks forwarded to the resource manager"
    );
    describe_counter!(
        CACHE_INSERTED,
        Unit::Count,
        "Number of released resources kept in the cache"
    );
    describe_counter!(
        CACHE_EVICTED,
        Unit::Count,
        "Number of cache entries released to the resource manager by the eviction sweep"
    );
    describe_counter!(
        CACHE_INVALIDATED,
        Unit::Count,
        "Number of cache entries dropped because of a resource manager notification"
    );
    describe_gauge!(CACHE_SIZE, Unit::Count, "Number of entries in the cache");
}
