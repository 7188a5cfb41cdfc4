//! Connection supervision
//!
//! One supervisor per population keeps a WebSocket session open to every
//! candidate address. Each tick it walks the candidates and dials every
//! address that is neither connected nor already being dialed. A dial runs
//! in its own task; on success that task greets the peer with
//! `manager:register` and becomes the session's receive loop.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use lz_core::{LinkState, PeerAddr, PeerRole};
use lz_protocol::{command, Envelope};

use super::pool::ConnectionPool;
use super::session::Session;
use crate::discovery::DiscoveredApp;
use crate::router::MessageRouter;

/// Address and port of one peer to keep connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Peer address
    pub addr: PeerAddr,
    /// Port the peer listens on
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(addr: PeerAddr, port: u16) -> Self {
        Self { addr, port }
    }
}

/// Where a supervisor gets its candidate addresses from
pub enum CandidateSource {
    /// A fixed list
    Static(Vec<Endpoint>),
    /// A fixed list grown by discovery
    Discovered {
        /// Known endpoints, static ones first
        known: Vec<Endpoint>,
        /// Port used when discovery did not report one
        default_port: u16,
        /// Newly discovered consoles
        updates: mpsc::UnboundedReceiver<DiscoveredApp>,
    },
}

impl CandidateSource {
    /// Current candidate set, after merging pending discovery updates.
    ///
    /// A rediscovered address keeps its position and takes the newly
    /// advertised port.
    pub fn poll(&mut self) -> Vec<Endpoint> {
        match self {
            CandidateSource::Static(endpoints) => endpoints.clone(),
            CandidateSource::Discovered {
                known,
                default_port,
                updates,
            } => {
                while let Ok(app) = updates.try_recv() {
                    let endpoint = Endpoint::new(app.addr, app.port.unwrap_or(*default_port));
                    match known.iter_mut().find(|e| e.addr == endpoint.addr) {
                        Some(existing) => existing.port = endpoint.port,
                        None => known.push(endpoint),
                    }
                }
                known.clone()
            }
        }
    }
}

/// Keeps one population connected
pub struct Supervisor {
    role: PeerRole,
    interval: Duration,
    connect_timeout: Duration,
    send_timeout: Duration,
    links: DashMap<PeerAddr, LinkState>,
    pool: Arc<ConnectionPool>,
    router: Arc<MessageRouter>,
    span: Span,
}

impl Supervisor {
    /// Create a supervisor feeding `pool`
    pub fn new(
        pool: Arc<ConnectionPool>,
        router: Arc<MessageRouter>,
        interval: Duration,
        connect_timeout: Duration,
        send_timeout: Duration,
        span: Span,
    ) -> Self {
        Self {
            role: pool.role(),
            interval,
            connect_timeout,
            send_timeout,
            links: DashMap::new(),
            pool,
            router,
            span,
        }
    }

    /// Connection pool this supervisor fills
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Link state of an address (`Disconnected` if never attempted)
    pub fn link_state(&self, addr: &PeerAddr) -> LinkState {
        self.links.get(addr).map(|s| *s).unwrap_or_default()
    }

    /// Whether a new dial should be started for `addr`.
    ///
    /// A recorded `Connected` state is only trusted while the pool still
    /// holds an open session for the address.
    pub fn needs_connect(&self, addr: &PeerAddr) -> bool {
        match self.link_state(addr) {
            LinkState::Connecting => false,
            LinkState::Connected => self.pool.get_open(addr).is_none(),
            LinkState::Disconnected => true,
        }
    }

    /// Supervise until cancelled, then close every session of the pool
    pub async fn run(self: Arc<Self>, mut source: CandidateSource, cancel: CancellationToken) {
        let span = self.span.clone();
        async {
            tracing::info!("Supervising {} connections every {:?}", self.role, self.interval);

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for endpoint in source.poll() {
                    self.start_connect(endpoint);
                }
            }

            tracing::info!("Closing {} {} connection(s)", self.pool.len(), self.role);
            self.pool.close_all();
        }
        .instrument(span)
        .await
    }

    /// Start a dial to `endpoint` unless one is pending or a session is open.
    ///
    /// Returns whether a dial was started.
    pub fn start_connect(self: &Arc<Self>, endpoint: Endpoint) -> bool {
        if !self.needs_connect(&endpoint.addr) {
            return false;
        }

        self.links.insert(endpoint.addr, LinkState::Connecting);
        let supervisor = Arc::clone(self);
        let span = tracing::debug_span!(parent: &self.span, "link", addr = %endpoint.addr);
        tokio::spawn(async move { supervisor.connect(endpoint).await }.instrument(span));
        true
    }

    async fn connect(&self, endpoint: Endpoint) {
        let addr = endpoint.addr;

        let (session, reader) = match Session::open(
            addr,
            self.role,
            endpoint.port,
            self.connect_timeout,
            self.send_timeout,
        )
        .await
        {
            Ok(opened) => opened,
            Err(e) => {
                tracing::debug!("{}", e);
                self.links.insert(addr, LinkState::Disconnected);
                return;
            }
        };

        self.pool.insert(Arc::clone(&session));
        self.links.insert(addr, LinkState::Connected);
        tracing::info!("Connected to {} {}", self.role, addr);

        if let Err(e) = session.send(&Envelope::manager(command::REGISTER)).await {
            tracing::warn!("Failed to greet {} {}: {}", self.role, addr, e);
        }

        self.router.serve(Arc::clone(&session), reader).await;
        self.link_lost(&addr);
    }

    /// Record that a served session ended.
    ///
    /// Leaves the state alone when a newer dial is in flight or has already
    /// replaced the session.
    fn link_lost(&self, addr: &PeerAddr) {
        if self.pool.get_open(addr).is_some() {
            return;
        }
        if let Some(mut state) = self.links.get_mut(addr) {
            if *state == LinkState::Connected {
                *state = LinkState::Disconnected;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::detached_session;
    use crate::registry::DeviceRegistry;
    use lz_core::config::HealthConfig;

    fn addr(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    fn supervisor(role: PeerRole) -> Arc<Supervisor> {
        let agents = Arc::new(ConnectionPool::new(PeerRole::Agent));
        let apps = Arc::new(ConnectionPool::new(PeerRole::App));
        let registry = Arc::new(DeviceRegistry::new(
            HealthConfig::default(),
            CancellationToken::new(),
            Span::none(),
        ));
        let pool = match role {
            PeerRole::Agent => Arc::clone(&agents),
            PeerRole::App => Arc::clone(&apps),
        };
        let router = Arc::new(MessageRouter::new(agents, apps, registry, Span::none()));
        Arc::new(Supervisor::new(
            pool,
            router,
            Duration::from_millis(20),
            Duration::from_millis(200),
            Duration::from_millis(200),
            Span::none(),
        ))
    }

    #[test]
    fn test_static_candidates() {
        let mut source = CandidateSource::Static(vec![Endpoint::new(addr("10.0.0.5"), 8765)]);
        assert_eq!(source.poll(), vec![Endpoint::new(addr("10.0.0.5"), 8765)]);
        assert_eq!(source.poll().len(), 1);
    }

    #[test]
    fn test_discovered_candidates_merge_into_static_ones() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = CandidateSource::Discovered {
            known: vec![Endpoint::new(addr("10.0.0.40"), 8767)],
            default_port: 8767,
            updates: rx,
        };

        tx.send(DiscoveredApp {
            addr: addr("10.0.0.41"),
            port: None,
            name: "b".to_string(),
        })
        .unwrap();
        tx.send(DiscoveredApp {
            addr: addr("10.0.0.40"),
            port: Some(9000),
            name: "a".to_string(),
        })
        .unwrap();

        assert_eq!(
            source.poll(),
            vec![
                Endpoint::new(addr("10.0.0.40"), 9000),
                Endpoint::new(addr("10.0.0.41"), 8767),
            ]
        );
        // Updates are consumed; the merged set is kept
        assert_eq!(source.poll().len(), 2);
    }

    #[tokio::test]
    async fn test_needs_connect_follows_link_state() {
        let sup = supervisor(PeerRole::Agent);
        let target = addr("10.0.0.5");
        assert!(sup.needs_connect(&target));

        sup.links.insert(target, LinkState::Connecting);
        assert!(!sup.needs_connect(&target));

        // Connected without an open session in the pool is stale
        sup.links.insert(target, LinkState::Connected);
        assert!(sup.needs_connect(&target));

        let (session, _rx) = detached_session(target, PeerRole::Agent);
        sup.pool().insert(Arc::clone(&session));
        assert!(!sup.needs_connect(&target));

        session.close();
        assert!(sup.needs_connect(&target));
    }

    #[tokio::test]
    async fn test_lost_link_does_not_clobber_newer_dial() {
        let sup = supervisor(PeerRole::Agent);
        let target = addr("10.0.0.5");

        sup.links.insert(target, LinkState::Connecting);
        sup.link_lost(&target);
        assert_eq!(sup.link_state(&target), LinkState::Connecting);
        assert!(!sup.needs_connect(&target));

        sup.links.insert(target, LinkState::Connected);
        let (session, _rx) = detached_session(target, PeerRole::Agent);
        sup.pool().insert(Arc::clone(&session));
        sup.link_lost(&target);
        assert_eq!(sup.link_state(&target), LinkState::Connected);

        session.close();
        sup.link_lost(&target);
        assert_eq!(sup.link_state(&target), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_dial_returns_to_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let sup = supervisor(PeerRole::Agent);
        let target = addr("127.0.0.1");
        assert!(sup.start_connect(Endpoint::new(target, port)));
        assert!(!sup.start_connect(Endpoint::new(target, port)));

        tokio::time::timeout(Duration::from_secs(2), async {
            while sup.link_state(&target) != LinkState::Disconnected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(sup.pool().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let sup = supervisor(PeerRole::App);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            Arc::clone(&sup).run(CandidateSource::Static(Vec::new()), cancel.clone()),
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
