// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! This crate contains the core types shared by the corral components: identifiers, the
//! reservation/resource model, resource manager change notifications, per-handle events,
//! time and configuration.

mod macros;

pub mod changes;
pub mod clock;
pub mod config;
pub mod config_loader;
pub mod events;
pub mod identifiers;
pub mod resources;
pub mod time;

pub use clock::{Clock, WallClock};
#[cfg(any(test, feature = "test-util"))]
pub use clock::MockClock;
