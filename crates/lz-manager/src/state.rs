//! Global broker state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lz_core::config::BrokerConfig;
use lz_core::PeerRole;

use crate::connection::ConnectionPool;
use crate::registry::DeviceRegistry;
use crate::router::MessageRouter;

/// Shared state of the broker daemon
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// Agent sessions
    pub agents: Arc<ConnectionPool>,
    /// Console sessions
    pub apps: Arc<ConnectionPool>,
    /// Registered devices
    pub registry: Arc<DeviceRegistry>,
    /// Message router
    pub router: Arc<MessageRouter>,
}

impl BrokerState {
    /// Create the broker state.
    ///
    /// `cancel` stops the background tasks the registry starts.
    pub fn new(config: BrokerConfig, cancel: CancellationToken) -> Self {
        let agents = Arc::new(ConnectionPool::new(PeerRole::Agent));
        let apps = Arc::new(ConnectionPool::new(PeerRole::App));
        let registry = Arc::new(DeviceRegistry::new(
            config.health.clone(),
            cancel,
            tracing::info_span!("registry"),
        ));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&agents),
            Arc::clone(&apps),
            Arc::clone(&registry),
            tracing::info_span!("router"),
        ));

        Self {
            config,
            agents,
            apps,
            registry,
            router,
        }
    }

    /// Get the pool for one population
    pub fn pool(&self, role: PeerRole) -> &Arc<ConnectionPool> {
        match role {
            PeerRole::Agent => &self.agents,
            PeerRole::App => &self.apps,
        }
    }
}
