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

use anyhow::Context;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_anti_deadlock::GangAntiDeadlockBroker;
use corral_registry::{ReservationBroker, ReservationRegistry};
use corral_resource_cache::{CachingRmConnector, ResourceCache, policy_from_options};
use corral_rm_connector::RmConnector;
use corral_tracing_instrumentation::{LoggingError, LoggingGuard, init_logging};
use corral_types::Clock;
use corral_types::config::BrokerOptions;
use corral_types::config_loader::ConfigLoader;
use corral_types::identifiers::QueueName;

type CachingConnector = CachingRmConnector<Arc<dyn RmConnector>>;

/// The broker of one queue: resource cache, registry and anti-deadlock controller stacked on
/// top of a resource manager connector, plus the background loops driving them.
pub struct QueueBroker {
    queue: QueueName,
    registry: Arc<ReservationRegistry>,
    caching: Option<Arc<CachingConnector>>,
    anti_deadlock: Option<Arc<GangAntiDeadlockBroker>>,
    broker: Arc<dyn ReservationBroker>,
    cancellation: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl QueueBroker {
    /// Builds the stack described by `options`, registers with the resource manager and spawns
    /// the background loops. Must be called from within a tokio runtime.
    pub async fn start(
        options: &BrokerOptions,
        connector: Arc<dyn RmConnector>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        options.validate().context("invalid broker options")?;
        crate::describe_metrics();

        let queue = options.queue.clone();
        let cancellation = CancellationToken::new();
        let mut tasks = Vec::new();

        let caching = options.cache.enabled.then(|| {
            let cache = ResourceCache::new(Arc::clone(&clock), policy_from_options(&options.cache));
            Arc::new(CachingRmConnector::new(connector.clone(), Arc::new(cache)))
        });
        let registry_connector: Arc<dyn RmConnector> = match &caching {
            Some(caching) => Arc::clone(caching) as _,
            None => connector,
        };

        let registry = Arc::new(ReservationRegistry::new(
            queue.clone(),
            registry_connector,
            Arc::clone(&clock),
        ));
        registry
            .start()
            .await
            .with_context(|| format!("failed to register queue '{queue}' with the resource manager"))?;

        if let Some(caching) = &caching {
            tasks.push((
                "resource-cache-eviction",
                tokio::spawn(Arc::clone(caching).run_eviction(
                    options.cache.eviction_run_interval(),
                    cancellation.child_token(),
                )),
            ));
        }

        let anti_deadlock = options.anti_deadlock.enabled.then(|| {
            GangAntiDeadlockBroker::new(
                Arc::clone(&registry),
                Arc::clone(&clock),
                options.anti_deadlock.clone(),
            )
        });
        if let Some(anti_deadlock) = &anti_deadlock {
            tasks.push((
                "gang-anti-deadlock",
                tokio::spawn(Arc::clone(anti_deadlock).run(cancellation.child_token())),
            ));
        }

        let broker: Arc<dyn ReservationBroker> = match &anti_deadlock {
            Some(anti_deadlock) => Arc::clone(anti_deadlock) as _,
            None => Arc::clone(&registry) as _,
        };

        info!(
            %queue,
            cache = options.cache.enabled,
            anti_deadlock = options.anti_deadlock.enabled,
            "Queue broker started"
        );
        Ok(Self {
            queue,
            registry,
            caching,
            anti_deadlock,
            broker,
            cancellation,
            tasks,
        })
    }

    /// Loads the options through `loader`, installs logging as configured and starts the
    /// broker.
    ///
    /// Logging is left alone if the host process installed a subscriber already, in which case
    /// no [`LoggingGuard`] is returned.
    pub async fn from_config(
        loader: &ConfigLoader,
        connector: Arc<dyn RmConnector>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<(Self, Option<LoggingGuard>)> {
        let options = loader
            .load_once()
            .context("failed to load the broker configuration")?;

        let logging = match init_logging(&options.logging) {
            Ok(guard) => Some(guard),
            Err(LoggingError::AlreadyInstalled(_)) => {
                warn!("A global subscriber is installed already, ignoring the logging options");
                None
            }
            Err(err) => return Err(err).context("failed to install logging"),
        };

        let broker = Self::start(&options, connector, clock).await?;
        Ok((broker, logging))
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// The entry point for clients of this queue.
    pub fn broker(&self) -> &Arc<dyn ReservationBroker> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<ReservationRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> Option<&Arc<ResourceCache>> {
        self.caching.as_ref().map(|caching| caching.cache())
    }

    pub fn anti_deadlock(&self) -> Option<&Arc<GangAntiDeadlockBroker>> {
        self.anti_deadlock.as_ref()
    }

    /// Stops the background loops, releases every reservation and cached resource, and
    /// unregisters from the resource manager.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancellation.cancel();

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        for (name, result) in names.into_iter().zip(join_all(handles).await) {
            match result {
                Ok(()) => debug!(task = name, "Background task stopped"),
                Err(err) => warn!(task = name, %err, "Background task failed"),
            }
        }

        // cached resources go back before the registry unregisters from the connector
        if let Some(caching) = &self.caching {
            caching.stop().await;
        }
        self.registry
            .stop()
            .await
            .with_context(|| format!("failed to stop the registry of queue '{}'", self.queue))?;

        info!(queue = %self.queue, "Queue broker stopped");
        Ok(())
    }
}
