// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use corral_types::config::{CacheOptions, EvictionPolicyKind};
use corral_types::time::MillisSinceEpoch;

use crate::CacheEntry;

/// Decides whether a cache entry should be given back to the resource manager.
pub trait EvictionPolicy: Send + Sync + 'static {
    fn should_evict(&self, entry: &CacheEntry, now: MillisSinceEpoch) -> bool;
}

/// Evicts entries once they have been cached for at least `idle_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeoutEvictionPolicy {
    idle_timeout: Duration,
}

impl IdleTimeoutEvictionPolicy {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }
}

impl EvictionPolicy for IdleTimeoutEvictionPolicy {
    fn should_evict(&self, entry: &CacheEntry, now: MillisSinceEpoch) -> bool {
        now.saturating_duration_since(entry.cached_on()) >= self.idle_timeout
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverEvictPolicy;

impl EvictionPolicy for NeverEvictPolicy {
    fn should_evict(&self, _entry: &CacheEntry, _now: MillisSinceEpoch) -> bool {
        false
    }
}

pub fn policy_from_options(options: &CacheOptions) -> Box<dyn EvictionPolicy> {
    match options.eviction_policy {
        EvictionPolicyKind::IdleTimeout => Box::new(IdleTimeoutEvictionPolicy::new(
            options.eviction_idle_timeout(),
        )),
        EvictionPolicyKind::Never => Box::new(NeverEvictPolicy),
    }
}
