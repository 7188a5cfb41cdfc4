//! lz-manager: connection broker between fleet agents and operator consoles
//!
//! The broker dials out to every agent at its configured addresses and to
//! every console it knows about or discovers over mDNS. It keeps a registry
//! of the devices behind the agents, pings them to track liveness, and
//! relays JSON envelopes between consoles and agents.

pub mod broker;
pub mod connection;
pub mod discovery;
pub mod registry;
pub mod router;
pub mod state;

pub use broker::Broker;
pub use registry::DeviceRegistry;
pub use router::{MessageRouter, RouteError};
pub use state::BrokerState;
