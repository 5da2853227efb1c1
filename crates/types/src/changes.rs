// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

use crate::identifiers::ResourceId;
use crate::resources::{Allocation, ResourceStatus};

/// A fact reported by the resource manager about a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::EnumDiscriminants)]
#[strum_discriminants(derive(strum::Display))]
#[strum_discriminants(name(RmChangeKind))]
pub enum RmChange {
    Allocated {
        resource_id: ResourceId,
        allocation: Allocation,
    },
    Rejected {
        resource_id: ResourceId,
    },
    Preempted {
        resource_id: ResourceId,
    },
    Lost {
        resource_id: ResourceId,
    },
}

impl RmChange {
    pub fn allocated(resource_id: ResourceId, allocation: Allocation) -> Self {
        RmChange::Allocated {
            resource_id,
            allocation,
        }
    }

    pub fn rejected(resource_id: ResourceId) -> Self {
        RmChange::Rejected { resource_id }
    }

    pub fn preempted(resource_id: ResourceId) -> Self {
        RmChange::Preempted { resource_id }
    }

    pub fn lost(resource_id: ResourceId) -> Self {
        RmChange::Lost { resource_id }
    }

    pub fn resource_id(&self) -> ResourceId {
        match self {
            RmChange::Allocated { resource_id, .. }
            | RmChange::Rejected { resource_id }
            | RmChange::Preempted { resource_id }
            | RmChange::Lost { resource_id } => *resource_id,
        }
    }

    pub fn status(&self) -> ResourceStatus {
        match self {
            RmChange::Allocated { .. } => ResourceStatus::Allocated,
            RmChange::Rejected { .. } => ResourceStatus::Rejected,
            RmChange::Preempted { .. } => ResourceStatus::Preempted,
            RmChange::Lost { .. } => ResourceStatus::Lost,
        }
    }

    pub fn kind(&self) -> RmChangeKind {
        RmChangeKind::from(self)
    }
}
