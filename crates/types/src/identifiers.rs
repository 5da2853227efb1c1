// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use crate::macros::ulid_backed_id;

#[derive(Debug, thiserror::Error)]
pub enum IdDecodeError {
    #[error("bad format, expected '<prefix>_<ulid>'")]
    Format,
    #[error("id prefix doesn't match the expected type")]
    TypeMismatch,
    #[error(transparent)]
    Ulid(#[from] ulid::DecodeError),
}

ulid_backed_id!(
    /// Identifies a reservation. Assigned by the caller of `reserve` and unique per broker.
    ReservationId,
    "rsv"
);

ulid_backed_id!(
    /// Identifies a placed resource. Clients pick these for their asks, the resource cache mints
    /// new ones for cached entries.
    ResourceId,
    "res"
);

ulid_backed_id!(
    /// Identifies a client (handle) owning reservations. Events are grouped per handle.
    HandleId,
    "hdl"
);

/// Cheap to clone string backing the named identifiers below.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
#[display("{_0}")]
struct Name(Arc<str>);

macro_rules! named_id {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            derive_more::Display,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Name);

        impl $name {
            pub fn as_str(&self) -> &str {
                &(self.0).0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(Name(value.into()))
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(Name(value.into()))
            }
        }
    };
}

named_id!(
    /// Name of the resource manager queue a reservation is placed against.
    QueueName
);

named_id!(
    /// Identifier the resource manager assigned to an allocated resource (e.g. a container id).
    RmResourceId
);

named_id!(
    /// Node (host) name used for locality hints and actual placements.
    Location
);
