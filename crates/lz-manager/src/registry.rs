//! Device registry
//!
//! Every agent that has answered `register` has exactly one entry here,
//! keyed by address. The entry owns the agent's current session, its
//! reported properties and its liveness. Entries are never removed: a lost
//! device stays listed as `Offline` until it reconnects and registers again.
//!
//! The registry also starts the [`HealthMonitor`] the first time a device
//! registers.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use lz_core::config::HealthConfig;
use lz_core::error::ConnectionError;
use lz_core::time::{current_time_millis, is_within};
use lz_core::PeerAddr;
use lz_protocol::{command, DeviceInfo, DeviceProperties, DeviceStatus, Envelope, ProtocolError};

use crate::connection::{HealthMonitor, Session, SessionId};

/// A connected fleet terminal
#[derive(Debug, Clone)]
pub struct Agent {
    addr: PeerAddr,
    id: u8,
    session: Arc<Session>,
}

impl Agent {
    /// Bind an agent identity to its session
    pub fn new(session: Arc<Session>) -> Self {
        let addr = session.addr();
        Self {
            addr,
            id: addr.device_id(),
            session,
        }
    }

    /// Agent address
    pub fn addr(&self) -> PeerAddr {
        self.addr
    }

    /// Numeric id (last address octet)
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Current session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

/// A registered device
#[derive(Debug, Clone)]
pub struct Device {
    /// The agent this device is reached through
    pub agent: Agent,
    /// Properties reported at registration
    pub properties: DeviceProperties,
    /// Current liveness
    pub status: DeviceStatus,
    /// Last time the device proved alive (Unix ms)
    pub last_seen: u64,
}

impl Device {
    /// Snapshot for consoles
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            address: self.agent.addr().to_string(),
            id: self.agent.id(),
            site: self.properties.site.clone(),
            bv_type: self.properties.bv_type.clone(),
            device_type: self.properties.device_type.clone(),
            status: self.status,
            version: self.properties.version_or_unknown().to_string(),
            last_seen: self.last_seen,
        }
    }

    fn mark_online(&mut self, now: u64) {
        self.status = DeviceStatus::Online;
        self.last_seen = now;
    }
}

/// What the health monitor should do with one device
#[derive(Debug)]
pub(crate) enum PingCandidate {
    /// No such device
    Gone,
    /// Seen within the freshness window
    Fresh,
    /// Needs a keepalive on this session
    Due(Arc<Session>),
}

/// Registry of every device that has ever registered
pub struct DeviceRegistry {
    devices: DashMap<PeerAddr, Device>,
    health: HealthConfig,
    monitor_started: AtomicBool,
    cancel: CancellationToken,
    span: Span,
}

impl DeviceRegistry {
    /// Create an empty registry.
    ///
    /// `cancel` stops the health monitor once it has been started.
    pub fn new(health: HealthConfig, cancel: CancellationToken, span: Span) -> Self {
        Self {
            devices: DashMap::new(),
            health,
            monitor_started: AtomicBool::new(false),
            cancel,
            span,
        }
    }

    /// Register (or re-register) the agent on `session`.
    ///
    /// The device becomes `Online` with `last_seen = now`. If the address
    /// was bound to a different session that is still open, that session is
    /// closed. The first registration starts the health monitor.
    ///
    /// Returns `None` without touching the registry when `session` is
    /// already closed.
    pub fn register(
        self: &Arc<Self>,
        session: &Arc<Session>,
        properties: DeviceProperties,
    ) -> Option<DeviceInfo> {
        let _enter = self.span.enter();

        if !session.is_open() {
            tracing::debug!("Ignoring register from closed session {}", session.id());
            return None;
        }

        if properties.is_empty() {
            tracing::warn!("Agent {} registered without properties", session.addr());
        }

        let device = Device {
            agent: Agent::new(Arc::clone(session)),
            properties,
            status: DeviceStatus::Online,
            last_seen: current_time_millis(),
        };
        let info = device.info();

        let previous = self.devices.insert(session.addr(), device);
        match previous {
            Some(prev) => {
                let old = prev.agent.session();
                if old.id() != session.id() && old.is_open() {
                    tracing::info!(
                        "Device {} re-registered on a new connection, closing the old one",
                        info.address
                    );
                    old.close();
                }
            }
            None => tracing::info!(
                "Registered device {} (id {}, version {})",
                info.address,
                info.id,
                info.version
            ),
        }

        self.ensure_health_monitor();
        Some(info)
    }

    /// Apply an agent-originated envelope.
    ///
    /// `register` (re)registers the device, `ping`/`pong` refresh it. Other
    /// commands are logged and dropped.
    pub fn handle(
        self: &Arc<Self>,
        session: &Arc<Session>,
        envelope: Envelope,
    ) -> Result<(), ProtocolError> {
        match envelope.command.as_str() {
            command::REGISTER => {
                let parsed = DeviceProperties::from_result(envelope.result.as_ref())?;
                self.register(session, parsed.properties);
            }
            command::PING | command::PONG => {
                self.touch(session);
            }
            other => {
                let _enter = self.span.enter();
                tracing::debug!(
                    "Ignoring unhandled command '{}' from agent {}",
                    other,
                    session.addr()
                );
            }
        }
        Ok(())
    }

    /// Record traffic from `session`: the device is `Online`, seen now.
    ///
    /// Only applies while `session` is open and is the device's current
    /// session. Returns whether a device was updated.
    pub fn touch(&self, session: &Session) -> bool {
        self.touch_at(session, current_time_millis())
    }

    fn touch_at(&self, session: &Session, now: u64) -> bool {
        if !session.is_open() {
            return false;
        }
        match self.devices.get_mut(&session.addr()) {
            Some(mut device) if device.agent.session.id() == session.id() => {
                device.mark_online(now);
                true
            }
            _ => false,
        }
    }

    /// Mark the device `Offline` after its session `session_id` went away.
    ///
    /// Ignored if the device has since moved to another session.
    pub fn mark_disconnected(&self, addr: &PeerAddr, session_id: SessionId) -> bool {
        match self.devices.get_mut(addr) {
            Some(mut device)
                if device.agent.session.id() == session_id
                    && device.status == DeviceStatus::Online =>
            {
                device.status = DeviceStatus::Offline;
                let _enter = self.span.enter();
                tracing::info!("Device {} is now Offline (disconnected)", addr);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of every device, ordered by address
    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<(PeerAddr, DeviceInfo)> = self
            .devices
            .iter()
            .map(|entry| (*entry.key(), entry.value().info()))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        devices.into_iter().map(|(_, info)| info).collect()
    }

    /// Snapshot of one device
    pub fn get(&self, addr: &PeerAddr) -> Option<DeviceInfo> {
        self.devices.get(addr).map(|device| device.info())
    }

    /// Session of a registered device, if that session is still open
    pub fn agent_session(&self, addr: &PeerAddr) -> Option<Arc<Session>> {
        self.devices
            .get(addr)
            .map(|device| Arc::clone(&device.agent.session))
            .filter(|session| session.is_open())
    }

    /// Registered addresses, ordered
    pub fn addresses(&self) -> Vec<PeerAddr> {
        let mut addrs: Vec<PeerAddr> = self.devices.iter().map(|entry| *entry.key()).collect();
        addrs.sort();
        addrs
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device has registered yet
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Whether the health monitor has been started
    pub fn health_monitor_started(&self) -> bool {
        self.monitor_started.load(Ordering::Acquire)
    }

    pub(crate) fn ping_candidate(&self, addr: &PeerAddr, now: u64, freshness: Duration) -> PingCandidate {
        match self.devices.get(addr) {
            None => PingCandidate::Gone,
            Some(device) if is_within(device.last_seen, now, freshness) => PingCandidate::Fresh,
            Some(device) => PingCandidate::Due(Arc::clone(&device.agent.session)),
        }
    }

    /// Apply the outcome of a keepalive sent on `session`
    pub(crate) fn record_ping(
        &self,
        addr: &PeerAddr,
        session: &Session,
        outcome: Result<(), &ConnectionError>,
        now: u64,
    ) {
        let Some(mut device) = self.devices.get_mut(addr) else {
            return;
        };
        if device.agent.session.id() != session.id() {
            return;
        }

        let _enter = self.span.enter();
        match outcome {
            Ok(()) => {
                tracing::trace!("Pinged device {}", addr);
                device.mark_online(now);
            }
            Err(e) if e.is_closed() => {
                if device.status == DeviceStatus::Offline {
                    tracing::debug!("Device {} still unreachable: connection closed", addr);
                } else {
                    tracing::warn!("Ping to device {} failed: connection closed", addr);
                }
                device.status = DeviceStatus::Offline;
                device.agent.session.close();
            }
            Err(e) => {
                tracing::error!("Ping to device {} failed: {}", addr, e);
                device.status = DeviceStatus::Offline;
            }
        }
    }

    fn ensure_health_monitor(self: &Arc<Self>) {
        if self.monitor_started.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!("First device registered, starting health monitor");
        let monitor = HealthMonitor::new(
            Arc::clone(self),
            self.health.clone(),
            tracing::info_span!(parent: &self.span, "health"),
        );
        monitor.spawn(self.cancel.child_token());
    }
}
