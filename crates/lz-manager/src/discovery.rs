//! Console discovery over mDNS / DNS-SD
//!
//! Consoles advertise themselves under a DNS-SD service type. The browser
//! task resolves them and hands each new console to the app supervisor,
//! which merges it into the set of addresses it keeps connected.
//!
//! Discovery is best effort: if the host has no usable multicast interface
//! the broker logs a warning and runs with its static console list only.

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use lz_core::config::DiscoveryConfig;
use lz_core::PeerAddr;

/// A console found on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredApp {
    /// Address to dial
    pub addr: PeerAddr,
    /// Advertised data port, if the console published one
    pub port: Option<u16>,
    /// DNS-SD instance name
    pub name: String,
}

/// De-duplicates resolved services by address
#[derive(Debug, Default)]
pub struct DiscoveryTracker {
    known: HashMap<String, PeerAddr>,
}

impl DiscoveryTracker {
    /// Record a resolved service.
    ///
    /// Returns the console to connect to, or `None` when the service has no
    /// address or its address is already known. IPv4 addresses are
    /// preferred over IPv6.
    pub fn observe(
        &mut self,
        name: &str,
        addresses: impl IntoIterator<Item = IpAddr>,
        port: Option<u16>,
    ) -> Option<DiscoveredApp> {
        let addr = preferred_address(addresses)?;

        if self.known.values().any(|known| *known == addr) {
            return None;
        }

        self.known.insert(name.to_string(), addr);
        Some(DiscoveredApp {
            addr,
            port,
            name: name.to_string(),
        })
    }

    /// Forget a withdrawn service so a later announcement is reported again
    pub fn forget(&mut self, name: &str) -> Option<PeerAddr> {
        self.known.remove(name)
    }

    /// Number of known consoles
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Whether no console is known
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

fn preferred_address(addresses: impl IntoIterator<Item = IpAddr>) -> Option<PeerAddr> {
    addresses
        .into_iter()
        .min_by_key(|ip| (ip.is_ipv6(), *ip))
        .map(PeerAddr::new)
}

/// mDNS browser feeding discovered consoles to the app supervisor
pub struct AppDiscovery {
    config: DiscoveryConfig,
    span: Span,
}

impl AppDiscovery {
    /// Create a browser for the configured service type
    pub fn new(config: DiscoveryConfig, span: Span) -> Self {
        Self { config, span }
    }

    /// Start browsing on the runtime
    pub fn spawn(
        self,
        updates: mpsc::UnboundedSender<DiscoveredApp>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let span = self.span.clone();
        tokio::spawn(self.run(updates, cancel).instrument(span))
    }

    async fn run(self, updates: mpsc::UnboundedSender<DiscoveredApp>, cancel: CancellationToken) {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                tracing::warn!("mDNS unavailable, no consoles will be discovered: {}", e);
                return;
            }
        };

        let events = match daemon.browse(&self.config.service_type) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(
                    "Cannot browse {}, no consoles will be discovered: {}",
                    self.config.service_type,
                    e
                );
                let _ = daemon.shutdown();
                return;
            }
        };

        tracing::info!("Browsing for consoles on {}", self.config.service_type);
        let mut tracker = DiscoveryTracker::default();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv_async() => event,
            };

            match event {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let port = info
                        .get_property_val_str(&self.config.port_property)
                        .and_then(|value| value.parse::<u16>().ok());
                    let addresses = info.get_addresses().iter().copied();

                    if let Some(app) = tracker.observe(info.get_fullname(), addresses, port) {
                        tracing::info!(
                            "Discovered console {} at {} ({} known)",
                            app.name,
                            app.addr,
                            tracker.len()
                        );
                        if updates.send(app).is_err() {
                            break;
                        }
                    }
                }
                Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                    if let Some(addr) = tracker.forget(&fullname) {
                        tracing::info!("Console {} at {} withdrawn", fullname, addr);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("mDNS browser stopped: {}", e);
                    break;
                }
            }
        }

        let _ = daemon.shutdown();
    }
}
