// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod anti_deadlock;
mod cache;
mod logging;

pub use anti_deadlock::*;
pub use cache::*;
pub use logging::*;

use serde::{Deserialize, Serialize};

use crate::identifiers::QueueName;

#[derive(Debug, thiserror::Error)]
#[error("invalid option '{option}': {reason}")]
pub struct InvalidOptionsError {
    option: &'static str,
    reason: String,
}

impl InvalidOptionsError {
    pub fn new(option: &'static str, reason: impl Into<String>) -> Self {
        Self {
            option,
            reason: reason.into(),
        }
    }

    pub fn option(&self) -> &'static str {
        self.option
    }
}

/// # Broker options
///
/// Configuration of the reservation broker serving a single queue.
#[derive(Debug, Clone, Serialize, Deserialize, derive_builder::Builder, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[builder(default)]
pub struct BrokerOptions {
    /// # Queue
    ///
    /// Name of the resource manager queue this broker registers with.
    #[builder(setter(into))]
    pub queue: QueueName,

    #[serde(flatten)]
    pub logging: LoggingOptions,

    pub anti_deadlock: AntiDeadlockOptions,

    pub cache: CacheOptions,
}

impl BrokerOptions {
    pub fn validate(&self) -> Result<(), InvalidOptionsError> {
        if self.queue.as_str().is_empty() {
            return Err(InvalidOptionsError::new("queue", "must not be empty"));
        }
        self.anti_deadlock.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            queue: QueueName::from("default"),
            logging: LoggingOptions::default(),
            anti_deadlock: AntiDeadlockOptions::default(),
            cache: CacheOptions::default(),
        }
    }
}
