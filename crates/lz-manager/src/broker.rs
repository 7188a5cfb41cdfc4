//! Broker assembly
//!
//! Wires configuration into the two supervisors, the optional console
//! browser and the shared state, then runs them until shutdown.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lz_core::config::BrokerConfig;
use lz_core::{LzError, PeerRole};

use crate::connection::{CandidateSource, Endpoint, Supervisor};
use crate::discovery::AppDiscovery;
use crate::state::BrokerState;

/// The connection broker
pub struct Broker {
    state: Arc<BrokerState>,
    cancel: CancellationToken,
}

impl Broker {
    /// Validate `config` and build the broker state
    pub fn new(config: BrokerConfig) -> Result<Self, LzError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let state = Arc::new(BrokerState::new(config, cancel.child_token()));
        Ok(Self { state, cancel })
    }

    /// Shared state
    pub fn state(&self) -> &Arc<BrokerState> {
        &self.state
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// On shutdown every session is closed and the health monitor and
    /// console browser are stopped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), LzError> {
        let config = &self.state.config;
        let agent_targets = config.agent_targets()?;

        tracing::info!(
            "Managing {} agent address(es) on port {}",
            agent_targets.len(),
            config.agent_port
        );

        let agents = CandidateSource::Static(
            agent_targets
                .into_iter()
                .map(|addr| Endpoint::new(addr, config.agent_port))
                .collect(),
        );

        let static_apps: Vec<Endpoint> = config
            .apps
            .iter()
            .map(|addr| Endpoint::new(*addr, config.app_port))
            .collect();

        let apps = if config.discovery.enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            AppDiscovery::new(config.discovery.clone(), tracing::info_span!("discovery"))
                .spawn(tx, self.cancel.child_token());
            CandidateSource::Discovered {
                known: static_apps,
                default_port: config.app_port,
                updates: rx,
            }
        } else {
            tracing::info!("Console discovery disabled");
            CandidateSource::Static(static_apps)
        };

        let agent_supervisor = self.supervisor(PeerRole::Agent);
        let app_supervisor = self.supervisor(PeerRole::App);

        let stop = self.cancel.clone();
        let relay = async move {
            shutdown.cancelled().await;
            tracing::info!("Shutting down broker...");
            stop.cancel();
        };

        tokio::join!(
            relay,
            agent_supervisor.run(agents, self.cancel.clone()),
            app_supervisor.run(apps, self.cancel.clone()),
        );

        tracing::info!(
            "Broker stopped with {} registered device(s)",
            self.state.registry.len()
        );
        Ok(())
    }

    fn supervisor(&self, role: PeerRole) -> Arc<Supervisor> {
        let config = &self.state.config;
        let interval = match role {
            PeerRole::Agent => config.agent_retry_interval,
            PeerRole::App => config.app_retry_interval,
        };

        Arc::new(Supervisor::new(
            Arc::clone(self.state.pool(role)),
            Arc::clone(&self.state.router),
            interval,
            config.connect_timeout,
            config.health.send_timeout,
            tracing::info_span!("supervisor", %role),
        ))
    }
}
