// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Generates a ulid backed identifier which is displayed as `<prefix>_<ulid>`.
///
/// Example:
/// ```ignore
/// ulid_backed_id!(ReservationId, "rsv");
/// ```
macro_rules! ulid_backed_id {
    ($(#[$m:meta])* $id_name:ident, $prefix:literal) => {
        $(#[$m])*
        #[derive(
            PartialEq,
            Eq,
            Clone,
            Copy,
            Hash,
            PartialOrd,
            Ord,
            serde_with::SerializeDisplay,
            serde_with::DeserializeFromStr,
        )]
        pub struct $id_name(ulid::Ulid);

        impl $id_name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }

            pub const fn from_parts(timestamp_ms: u64, random: u128) -> Self {
                Self(ulid::Ulid::from_parts(timestamp_ms, random))
            }

            /// Timestamp (in ms since epoch) encoded in the id when it was generated.
            pub fn timestamp_ms(&self) -> u64 {
                self.0.timestamp_ms()
            }
        }

        impl Default for $id_name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<u128> for $id_name {
            fn from(value: u128) -> Self {
                Self(ulid::Ulid::from(value))
            }
        }

        impl std::str::FromStr for $id_name {
            type Err = $crate::identifiers::IdDecodeError;

            fn from_str(input: &str) -> Result<Self, Self::Err> {
                let Some((prefix, raw)) = input.split_once('_') else {
                    return Err($crate::identifiers::IdDecodeError::Format);
                };
                if prefix != Self::PREFIX {
                    return Err($crate::identifiers::IdDecodeError::TypeMismatch);
                }
                Ok(Self(ulid::Ulid::from_string(raw)?))
            }
        }

        impl std::fmt::Display for $id_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::fmt::Debug for $id_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // use the same formatting for debug and display to show a consistent representation
                std::fmt::Display::fmt(self, f)
            }
        }
    };
}

pub(crate) use ulid_backed_id;
