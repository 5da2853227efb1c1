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

/// # Gang anti-deadlock options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[builder(default)]
pub struct AntiDeadlockOptions {
    /// # Enabled
    ///
    /// Wrap the reservation registry with the gang anti-deadlock controller. Only gang
    /// reservations are affected by it.
    pub enabled: bool,

    /// # No allocation limit
    ///
    /// If no resource of a submitted gang reservation got allocated for this long, a backoff
    /// round is started.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub no_allocation_limit: humantime::Duration,

    /// # Backoff percent
    ///
    /// Percentage (0-100) of the resources of in-flight gang reservations which are released
    /// during a backoff round.
    pub backoff_percent: u8,

    /// # Backoff min delay
    ///
    /// Lower bound of the random delay after which a backed-off reservation is re-submitted.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub backoff_min_delay: humantime::Duration,

    /// # Backoff max delay
    ///
    /// Upper bound (exclusive) of the random re-submission delay.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub backoff_max_delay: humantime::Duration,
}

impl AntiDeadlockOptions {
    pub fn no_allocation_limit(&self) -> Duration {
        *self.no_allocation_limit
    }

    pub fn backoff_min_delay(&self) -> Duration {
        *self.backoff_min_delay
    }

    pub fn backoff_max_delay(&self) -> Duration {
        *self.backoff_max_delay
    }

    pub fn validate(&self) -> Result<(), InvalidOptionsError> {
        if self.backoff_percent > 100 {
            return Err(InvalidOptionsError::new(
                "anti-deadlock.backoff-percent",
                format!("must be within 0..=100, got {}", self.backoff_percent),
            ));
        }
        if self.backoff_min_delay() > self.backoff_max_delay() {
            return Err(InvalidOptionsError::new(
                "anti-deadlock.backoff-min-delay",
                format!(
                    "must not exceed backoff-max-delay ({} > {})",
                    self.backoff_min_delay, self.backoff_max_delay
                ),
            ));
        }
        if self.no_allocation_limit().is_zero() {
            return Err(InvalidOptionsError::new(
                "anti-deadlock.no-allocation-limit",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for AntiDeadlockOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            no_allocation_limit: Duration::from_secs(30).into(),
            backoff_percent: 30,
            backoff_min_delay: Duration::from_secs(10).into(),
            backoff_max_delay: Duration::from_secs(30).into(),
        }
    }
}
