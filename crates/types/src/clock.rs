// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use crate::time::MillisSinceEpoch;

/// Source of the current time.
///
/// Everything that compares timestamps (cache idle timeouts, starvation detection, backoff
/// wake-up times) reads time through this trait so that it can be driven manually in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> MillisSinceEpoch;
}

/// Production implementation of [`Clock`] backed by system time.
#[derive(Debug, Default, Copy, Clone)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> MillisSinceEpoch {
        MillisSinceEpoch::now()
    }
}

#[cfg(any(test, feature = "test-util"))]
mod mock {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use super::Clock;
    use crate::time::MillisSinceEpoch;

    /// A clock that only moves when told to. Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        storage: Arc<AtomicU64>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self::with_timestamp(MillisSinceEpoch::now())
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_timestamp(timestamp: MillisSinceEpoch) -> Self {
            Self {
                storage: Arc::new(AtomicU64::new(timestamp.as_u64())),
            }
        }

        pub fn advance_ms(&self, ms: u64) {
            self.storage.fetch_add(ms, Ordering::SeqCst);
        }

        pub fn advance(&self, duration: Duration) {
            self.advance_ms(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        }

        pub fn set(&self, timestamp: MillisSinceEpoch) {
            self.storage.store(timestamp.as_u64(), Ordering::SeqCst);
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> MillisSinceEpoch {
            MillisSinceEpoch::new(self.storage.load(Ordering::SeqCst))
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockClock;
