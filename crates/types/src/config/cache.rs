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

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use super::InvalidOptionsError;

/// # Eviction policy
#[derive(Debug, Clone, Copy, Hash, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicyKind {
    /// # Idle timeout
    ///
    /// Evict entries which have been sitting in the cache for longer than
    /// `eviction-idle-timeout`.
    #[default]
    IdleTimeout,
    /// # Never
    ///
    /// Keep entries until they are consumed or invalidated by the resource manager.
    Never,
}

/// # Resource cache options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[builder(default)]
pub struct CacheOptions {
    /// # Enabled
    ///
    /// Keep released resources around so that new asks can be satisfied without a round trip
    /// to the resource manager.
    pub enabled: bool,

    /// # Eviction policy
    pub eviction_policy: EvictionPolicyKind,

    /// # Eviction run interval
    ///
    /// How often the eviction sweep runs.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub eviction_run_interval: humantime::Duration,

    /// # Eviction idle timeout
    ///
    /// Threshold of the `idle-timeout` eviction policy.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub eviction_idle_timeout: humantime::Duration,
}

impl CacheOptions {
    pub fn eviction_run_interval(&self) -> Duration {
        *self.eviction_run_interval
    }

    pub fn eviction_idle_timeout(&self) -> Duration {
        *self.eviction_idle_timeout
    }

    pub fn validate(&self) -> Result<(), InvalidOptionsError> {
        if self.eviction_run_interval().is_zero() {
            return Err(InvalidOptionsError::new(
                "cache.eviction-run-interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            eviction_policy: EvictionPolicyKind::default(),
            eviction_run_interval: Duration::from_secs(5).into(),
            eviction_idle_timeout: Duration::from_secs(30).into(),
        }
    }
}
