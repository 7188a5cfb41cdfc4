//! Broker configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::types::PeerAddr;

/// Configuration for the broker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Port every agent listens on
    pub agent_port: u16,

    /// Port consoles listen on when discovery does not advertise one
    pub app_port: u16,

    /// Candidate agent addresses.
    ///
    /// Each entry is a single address (`10.0.0.5`) or an IPv4 range over the
    /// last octet (`10.0.0.2-27`, inclusive).
    pub agents: Vec<String>,

    /// Addresses removed from the expanded agent list
    pub exclude_agents: Vec<PeerAddr>,

    /// Console addresses to dial in addition to discovered ones
    pub apps: Vec<PeerAddr>,

    /// Delay between agent connection sweeps
    #[serde(with = "duration_secs")]
    pub agent_retry_interval: Duration,

    /// Delay between console connection sweeps
    #[serde(with = "duration_secs")]
    pub app_retry_interval: Duration,

    /// Upper bound on a single WebSocket connect attempt
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Console discovery settings
    pub discovery: DiscoveryConfig,

    /// Device health monitoring settings
    pub health: HealthConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            agent_port: 8765,
            app_port: 8767,
            agents: vec!["127.0.0.1".to_string()],
            exclude_agents: vec![],
            apps: vec![],
            agent_retry_interval: Duration::from_secs(5),
            app_retry_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            discovery: DiscoveryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Expand `agents` into the concrete address list.
    ///
    /// Ranges are expanded in order, duplicates keep their first position,
    /// and `exclude_agents` is applied last.
    pub fn agent_targets(&self) -> Result<Vec<PeerAddr>, ConfigError> {
        let mut targets: Vec<PeerAddr> = Vec::new();

        for entry in &self.agents {
            for addr in parse_agent_entry(entry)? {
                if !targets.contains(&addr) && !self.exclude_agents.contains(&addr) {
                    targets.push(addr);
                }
            }
        }

        Ok(targets)
    }

    /// Check the configuration for values the broker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_port == 0 || self.app_port == 0 {
            return Err(ConfigError::Invalid("ports must be non-zero".to_string()));
        }

        for (name, value) in [
            ("agent_retry_interval", self.agent_retry_interval),
            ("app_retry_interval", self.app_retry_interval),
            ("connect_timeout", self.connect_timeout),
            ("health.interval", self.health.interval),
            ("health.freshness", self.health.freshness),
            ("health.send_timeout", self.health.send_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }

        if self.discovery.enabled && self.discovery.service_type.is_empty() {
            return Err(ConfigError::Invalid(
                "discovery.service_type must be set when discovery is enabled".to_string(),
            ));
        }

        self.agent_targets().map(|_| ())
    }
}

fn parse_agent_entry(entry: &str) -> Result<Vec<PeerAddr>, ConfigError> {
    let entry = entry.trim();

    if let Ok(addr) = entry.parse::<PeerAddr>() {
        return Ok(vec![addr]);
    }

    let invalid = || ConfigError::Invalid(format!("invalid agent address '{}'", entry));

    let (start, end) = entry.rsplit_once('-').ok_or_else(invalid)?;
    let start: Ipv4Addr = start.trim().parse().map_err(|_| invalid())?;
    let end: u8 = end.trim().parse().map_err(|_| invalid())?;

    let [a, b, c, first] = start.octets();
    if end < first {
        return Err(ConfigError::Invalid(format!(
            "agent range '{}' ends before it starts",
            entry
        )));
    }

    Ok((first..=end)
        .map(|last| PeerAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, last))))
        .collect())
}

/// Console discovery over mDNS / DNS-SD
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Browse for consoles at all
    pub enabled: bool,

    /// DNS-SD service type consoles advertise
    pub service_type: String,

    /// TXT property carrying the console's data port
    pub port_property: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: "_lazy._tcp.local.".to_string(),
            port_property: "port".to_string(),
        }
    }
}

/// Device keepalive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Delay between two sweeps through the device set
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Devices seen within this window are not pinged
    #[serde(with = "duration_secs")]
    pub freshness: Duration,

    /// Delay between two devices within one sweep
    #[serde(rename = "pacing_ms", with = "duration_millis")]
    pub pacing: Duration,

    /// How long a send may wait for room in a session's outbound queue
    #[serde(with = "duration_secs")]
    pub send_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            freshness: Duration::from_secs(10),
            pacing: Duration::from_millis(1000),
            send_timeout: Duration::from_secs(5),
        }
    }
}
