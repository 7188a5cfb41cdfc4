//! lz-protocol: Wire contract for the lazy-manager broker
//!
//! Every message exchanged between the broker, the fleet agents and the
//! operator consoles is a single JSON object (an [`Envelope`]) carried in
//! one WebSocket text frame. This crate owns that envelope, the typed view
//! of the properties an agent reports on registration, and the device
//! snapshot streamed back to consoles.

pub mod device;
pub mod envelope;
pub mod error;
pub mod properties;

pub use device::{DeviceInfo, DeviceStatus};
pub use envelope::{command, Envelope, Sender};
pub use error::ProtocolError;
pub use properties::{DeviceProperties, ParsedProperties};
