//! Wiring of the pool, importer and backlog into one running core.
//!
//! Frames flow pool fan-in → importer → notification broadcast → backlog.
//! Everything is owned by the [`RelayCore`] value; there is no global state.

use crate::backlog::{Backlog, ReqTask, SubscriptionCloser, TaskHandle};
use crate::config::CoreConfig;
use crate::error::{ClientError, Result};
use crate::external::{Codec, EventStore};
use crate::importer::{ImportNotification, Importer, ImporterService, ImporterStats};
use crate::message::Filter;
use crate::pool::{ConnectionPool, FilterRequest, RelayTarget, SendOutcome};
use crate::transport::Connector;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct RelayCore {
    config: CoreConfig,
    pool: Arc<ConnectionPool>,
    backlog: Backlog,
    importer: Mutex<Option<ImporterService>>,
}

impl RelayCore {
    /// Build the services and connect to the configured relays.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn Codec>,
        store: Arc<dyn EventStore>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(config.pool.clone(), config.relay.clone(), connector);
        let inbound = pool.take_inbound().ok_or(ClientError::ServiceStopped)?;
        let importer = Importer::new(
            config.importer.clone(),
            codec,
            store,
            Arc::clone(pool.registry()),
        )
        .spawn(inbound);

        let closer: Arc<dyn SubscriptionCloser> = pool.clone();
        let backlog = Backlog::spawn(config.backlog.clone(), closer, Some(importer.subscribe()));

        for descriptor in &config.relays {
            pool.add_connection(descriptor.clone());
        }
        pool.connect_all();
        info!("relay core started with {} relays", config.relays.len());

        Ok(Self {
            config,
            pool,
            backlog,
            importer: Mutex::new(Some(importer)),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    /// Importer notifications. Empty once the core has shut down.
    pub fn subscribe_notifications(&self) -> Option<broadcast::Receiver<ImportNotification>> {
        self.importer.lock().as_ref().map(ImporterService::subscribe)
    }

    pub fn importer_stats(&self) -> Option<ImporterStats> {
        self.importer.lock().as_ref().map(ImporterService::stats)
    }

    /// A task whose request sends `filters` through the pool.
    ///
    /// Customize it (`prio`, `timeout`, ...) and hand it to [`Backlog::add`].
    pub fn request(&self, filters: Vec<Filter>, target: RelayTarget) -> ReqTask {
        let pool = Arc::clone(&self.pool);
        ReqTask::new(move |subscription_id| {
            let request = FilterRequest::new(subscription_id, filters.clone()).replacing();
            match pool.send(request, target.clone()) {
                Ok(SendOutcome::Sent { relays }) => {
                    debug!("{} sent to {} relays", subscription_id, relays.len());
                }
                Ok(SendOutcome::NoRoute) => {
                    debug!("{} has no connected relay yet", subscription_id);
                }
                Err(e) => warn!("failed to send {}: {}", subscription_id, e),
            }
        })
    }

    /// Add a task for `filters` and fetch it right away.
    pub fn fetch(&self, filters: Vec<Filter>, target: RelayTarget) -> TaskHandle {
        let handle = self.backlog.add(self.request(filters, target));
        handle.fetch();
        handle
    }

    /// Stop the backlog, disconnect every relay and stop the importer.
    pub async fn shutdown(&self) {
        self.backlog.shutdown().await;
        self.pool.disconnect_all().await;
        let importer = self.importer.lock().take();
        if let Some(importer) = importer {
            importer.shutdown().await;
        }
        info!("relay core stopped");
    }
}

impl std::fmt::Debug for RelayCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCore")
            .field("relays", &self.pool.relays())
            .finish_non_exhaustive()
    }
}
