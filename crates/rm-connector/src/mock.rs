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
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use corral_types::changes::RmChange;
use corral_types::identifiers::{QueueName, ResourceId, RmResourceId};
use corral_types::resources::PlacedResource;

use crate::{ConnectorError, NodeDescriptor, RmConnector, RmEventHandler};

/// A call observed by the [`MockRmConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorCall {
    Register(QueueName),
    Unregister,
    Reserve(Vec<ResourceId>),
    Release {
        resource_ids: Vec<ResourceId>,
        do_not_cache: bool,
    },
    Reassign {
        rm_resource_id: RmResourceId,
        resource_id: ResourceId,
    },
}

/// In-memory connector recording every call. Notifications are pushed by the test through
/// [`MockRmConnector::deliver`].
#[derive(Default)]
pub struct MockRmConnector {
    handler: Mutex<Option<Arc<dyn RmEventHandler>>>,
    calls: Mutex<Vec<ConnectorCall>>,
    nodes: Mutex<Vec<NodeDescriptor>>,
    fail_reserve: AtomicBool,
    fail_release: AtomicBool,
    refuse_reassign: AtomicBool,
}

impl MockRmConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: Vec<NodeDescriptor>) -> Self {
        let connector = Self::default();
        *connector.nodes.lock() = nodes;
        connector
    }

    pub fn fail_reserve(&self, fail: bool) {
        self.fail_reserve.store(fail, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn refuse_reassign(&self, refuse: bool) {
        self.refuse_reassign.store(refuse, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn calls(&self) -> Vec<ConnectorCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// All resource ids submitted through `reserve`, in call order.
    pub fn reserved(&self) -> Vec<ResourceId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ConnectorCall::Reserve(ids) => Some(ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// All resource ids given back through `release`, in call order.
    pub fn released(&self) -> Vec<ResourceId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ConnectorCall::Release { resource_ids, .. } => Some(resource_ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn reassignments(&self) -> Vec<(RmResourceId, ResourceId)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ConnectorCall::Reassign {
                    rm_resource_id,
                    resource_id,
                } => Some((rm_resource_id.clone(), *resource_id)),
                _ => None,
            })
            .collect()
    }

    /// Delivers `changes` to the registered handler, as the resource manager would.
    ///
    /// # Panics
    /// If nothing is registered.
    pub async fn deliver(&self, changes: Vec<RmChange>) {
        let handler = self
            .handler
            .lock()
            .clone()
            .expect("a handler must be registered to deliver changes");
        handler.on_changes(changes).await;
    }

    /// Simulates the resource manager terminating the connector.
    ///
    /// # Panics
    /// If nothing is registered.
    pub async fn stop_by_rm(&self) {
        let handler = self
            .handler
            .lock()
            .clone()
            .expect("a handler must be registered to be stopped");
        handler.stopped_by_rm().await;
    }

    fn record(&self, call: ConnectorCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl RmConnector for MockRmConnector {
    async fn register(
        &self,
        queue: &QueueName,
        handler: Arc<dyn RmEventHandler>,
    ) -> Result<(), ConnectorError> {
        {
            let mut guard = self.handler.lock();
            if guard.is_some() {
                return Err(ConnectorError::AlreadyRegistered(queue.clone()));
            }
            *guard = Some(handler);
        }
        self.record(ConnectorCall::Register(queue.clone()));
        Ok(())
    }

    async fn unregister(&self) -> Result<(), ConnectorError> {
        if self.handler.lock().take().is_none() {
            return Err(ConnectorError::NotRegistered);
        }
        self.record(ConnectorCall::Unregister);
        Ok(())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeDescriptor>, ConnectorError> {
        Ok(self.nodes.lock().clone())
    }

    async fn reserve(&self, resources: Vec<PlacedResource>) -> Result<(), ConnectorError> {
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(ConnectorError::Unavailable("mock reserve failure".to_owned()));
        }
        self.record(ConnectorCall::Reserve(
            resources.iter().map(PlacedResource::resource_id).collect(),
        ));
        Ok(())
    }

    async fn release(
        &self,
        resources: Vec<PlacedResource>,
        do_not_cache: bool,
    ) -> Result<(), ConnectorError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(ConnectorError::Unavailable("mock release failure".to_owned()));
        }
        self.record(ConnectorCall::Release {
            resource_ids: resources.iter().map(PlacedResource::resource_id).collect(),
            do_not_cache,
        });
        Ok(())
    }

    async fn reassign_resource(
        &self,
        rm_resource_id: &RmResourceId,
        resource_id: ResourceId,
    ) -> Result<bool, ConnectorError> {
        if self.refuse_reassign.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.record(ConnectorCall::Reassign {
            rm_resource_id: rm_resource_id.clone(),
            resource_id,
        });
        Ok(true)
    }
}
