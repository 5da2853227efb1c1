// Copyright (c) 2023 - 2026 corral.dev.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Contract between the broker and a cluster resource manager (RM).
//!
//! The broker submits and releases resources through an [`RmConnector`]; the connector reports
//! what the RM did with them, asynchronously, to the [`RmEventHandler`] registered with it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use corral_types::changes::RmChange;
use corral_types::identifiers::{Location, QueueName, ResourceId, RmResourceId};
use corral_types::resources::PlacedResource;

#[cfg(any(test, feature = "test-util"))]
mod mock;

#[cfg(any(test, feature = "test-util"))]
pub use mock::{ConnectorCall, MockRmConnector};

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connector is not registered with a queue")]
    NotRegistered,
    #[error("connector is already registered with queue '{0}'")]
    AlreadyRegistered(QueueName),
    #[error("resource manager rejected the request: {0}")]
    Rejected(String),
    #[error("resource manager unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A cluster node as known by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub location: Location,
    pub cpu_vcores: u32,
    pub memory_mb: u64,
}

/// Receives resource manager notifications. Implemented by the reservation registry.
#[async_trait]
pub trait RmEventHandler: Send + Sync + 'static {
    /// A batch of changes about resources previously submitted through the connector.
    async fn on_changes(&self, changes: Vec<RmChange>);

    /// The connector terminated unexpectedly. Everything it handed out must be considered lost.
    async fn stopped_by_rm(&self);
}

#[async_trait]
pub trait RmConnector: Send + Sync + 'static {
    /// Registers with `queue`. Notifications are delivered to `handler` until [`Self::unregister`].
    async fn register(
        &self,
        queue: &QueueName,
        handler: Arc<dyn RmEventHandler>,
    ) -> Result<(), ConnectorError>;

    async fn unregister(&self) -> Result<(), ConnectorError>;

    async fn get_nodes(&self) -> Result<Vec<NodeDescriptor>, ConnectorError>;

    /// Submits asks. The outcome arrives later through [`RmEventHandler::on_changes`].
    async fn reserve(&self, resources: Vec<PlacedResource>) -> Result<(), ConnectorError>;

    /// Gives resources back. With `do_not_cache` set, intermediate caches must not keep them.
    async fn release(
        &self,
        resources: Vec<PlacedResource>,
        do_not_cache: bool,
    ) -> Result<(), ConnectorError>;

    /// Re-points the RM level resource `rm_resource_id` at the local id `resource_id`, so that
    /// future notifications about it carry `resource_id`. Returns `false` if the connector does
    /// not know the resource.
    async fn reassign_resource(
        &self,
        rm_resource_id: &RmResourceId,
        resource_id: ResourceId,
    ) -> Result<bool, ConnectorError>;
}

#[async_trait]
impl<T: RmConnector + ?Sized> RmConnector for Arc<T> {
    async fn register(
        &self,
        queue: &QueueName,
        handler: Arc<dyn RmEventHandler>,
    ) -> Result<(), ConnectorError> {
        (**self).register(queue, handler).await
    }

    async fn unregister(&self) -> Result<(), ConnectorError> {
        (**self).unregister().await
    }

    async fn get_nodes(&self) -> Result<Vec<NodeDescriptor>, ConnectorError> {
        (**self).get_nodes().await
    }

    async fn reserve(&self, resources: Vec<PlacedResource>) -> Result<(), ConnectorError> {
        (**self).reserve(resources).await
    }

    async fn release(
        &self,
        resources: Vec<PlacedResource>,
        do_not_cache: bool,
    ) -> Result<(), ConnectorError> {
        (**self).release(resources, do_not_cache).await
    }

    async fn reassign_resource(
        &self,
        rm_resource_id: &RmResourceId,
        resource_id: ResourceId,
    ) -> Result<bool, ConnectorError> {
        (**self).reassign_resource(rm_resource_id, resource_id).await
    }
}
