//! Message envelope for the lazy-manager protocol
//!
//! This module defines the single message shape exchanged between the
//! broker ("manager"), fleet terminals ("agents") and operator consoles
//! ("apps"). One envelope is serialized as one JSON object and carried in
//! one WebSocket text frame.
//!
//! # Wire Format
//!
//! ```json
//! {"sender": "app", "command": "ping", "target": "10.0.0.5", "senderIp": "10.0.0.40"}
//! ```
//!
//! `sender` and `command` are required. `target`, `result` and `senderIp`
//! are optional. Any other key is preserved in [`Envelope::extra`] and
//! written back out unchanged when the envelope is forwarded.
//!
//! # Message Flow
//!
//! Typical sequence:
//!
//! 1. Broker connects to an agent and sends `manager:register`
//! 2. Agent answers with `register`, its properties in `result`
//! 3. Broker sends `manager:ping` periodically, agent answers `ping`/`pong`
//! 4. A console sends a command with a `target`; the broker forwards it to
//!    the agent with `senderIp` set to the console's address
//! 5. The agent answers with a `result` and echoes `senderIp`; the broker
//!    forwards it to that console with `senderIp` rewritten to the agent's
//!    address

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ProtocolError;

/// Well-known command names
pub mod command {
    /// Registration request (broker) / registration report (agent)
    pub const REGISTER: &str = "register";
    /// Keepalive probe, also accepted from agents as the ack
    pub const PING: &str = "ping";
    /// Keepalive ack
    pub const PONG: &str = "pong";
    /// Console request for the full device snapshot
    pub const DEVICE_INFO: &str = "device_info";
    /// Alias of [`DEVICE_INFO`]
    pub const LIST: &str = "list";
    /// Failure reply for input that could not be parsed
    pub const ERROR: &str = "error";
}

/// Role of the peer that produced an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// A fleet terminal. Older terminal firmware identifies itself as `egm`.
    #[serde(alias = "egm")]
    Agent,
    /// An operator console
    App,
    /// The broker itself
    Manager,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::Agent => write!(f, "agent"),
            Sender::App => write!(f, "app"),
            Sender::Manager => write!(f, "manager"),
        }
    }
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Who produced this envelope
    pub sender: Sender,

    /// Command name (see [`command`])
    pub command: String,

    /// Address of the device a console command is aimed at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Command payload or outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Address of the peer on the other side of a forwarded exchange
    #[serde(
        rename = "senderIp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_ip: Option<String>,

    /// Keys this broker does not interpret, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with only the required fields set
    pub fn new(sender: Sender, command: impl Into<String>) -> Self {
        Self {
            sender,
            command: command.into(),
            target: None,
            result: None,
            sender_ip: None,
            extra: Map::new(),
        }
    }

    /// Create a broker-originated envelope
    pub fn manager(command: impl Into<String>) -> Self {
        Self::new(Sender::Manager, command)
    }

    /// Set the target address
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the result payload
    pub fn with_result(mut self, result: impl Into<Value>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Set the `senderIp` routing field
    pub fn with_sender_ip(mut self, sender_ip: impl Into<String>) -> Self {
        self.sender_ip = Some(sender_ip.into());
        self
    }

    /// Build the broker's failure reply to this envelope.
    ///
    /// The command, target and pass-through keys are kept so the console
    /// can correlate the reply with its request.
    pub fn failure(&self, reason: impl Into<String>) -> Self {
        let mut reply = self.clone();
        reply.sender = Sender::Manager;
        reply.result = Some(Value::String(reason.into()));
        reply
    }

    /// Failure reply for input that never parsed into an envelope
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::manager(command::ERROR).with_result(Value::String(reason.into()))
    }

    /// Whether this envelope carries the given command
    pub fn is_command(&self, name: &str) -> bool {
        self.command == name
    }

    /// Whether this is a console request for the device snapshot
    pub fn is_device_listing(&self) -> bool {
        self.is_command(command::DEVICE_INFO) || self.is_command(command::LIST)
    }

    /// Decode an envelope from a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.command.trim().is_empty() {
            return Err(ProtocolError::MissingField("command"));
        }
        Ok(envelope)
    }

    /// Encode this envelope as a JSON text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sender, self.command)?;
        if let Some(target) = &self.target {
            write!(f, " -> {}", target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_minimal_envelope() {
        let env = Envelope::from_json(r#"{"sender":"app","command":"device_info"}"#).unwrap();
        assert_eq!(env.sender, Sender::App);
        assert!(env.is_device_listing());
        assert!(env.target.is_none());
        assert!(env.result.is_none());
        assert!(env.sender_ip.is_none());
        assert!(env.extra.is_empty());
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        assert!(matches!(
            Envelope::from_json(r#"{"command":"ping"}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            Envelope::from_json(r#"{"sender":"app"}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            Envelope::from_json(r#"{"sender":"app","command":"  "}"#),
            Err(ProtocolError::MissingField("command"))
        ));
    }

    #[test]
    fn test_unknown_sender_is_rejected() {
        assert!(Envelope::from_json(r#"{"sender":"printer","command":"ping"}"#).is_err());
    }

    #[test]
    fn test_legacy_egm_sender_is_agent() {
        let env = Envelope::from_json(r#"{"sender":"egm","command":"pong"}"#).unwrap();
        assert_eq!(env.sender, Sender::Agent);

        // Always written back out with the canonical name
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["sender"], "agent");
    }

    #[test]
    fn test_sender_ip_uses_camel_case_on_the_wire() {
        let env = Envelope::new(Sender::App, "ping")
            .with_target("10.0.0.5")
            .with_sender_ip("10.0.0.40");
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(json["senderIp"], "10.0.0.40");
        assert_eq!(json["target"], "10.0.0.5");
        assert!(json.get("sender_ip").is_none());
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let text = r#"{"sender":"app","command":"start_egmc","target":"10.0.0.5","requestId":7,"args":["x"]}"#;
        let env = Envelope::from_json(text).unwrap();
        assert_eq!(env.extra.get("requestId"), Some(&json!(7)));

        let forwarded = env.with_sender_ip("10.0.0.40");
        let json: Value = serde_json::from_str(&forwarded.to_json().unwrap()).unwrap();
        assert_eq!(json["requestId"], 7);
        assert_eq!(json["args"], json!(["x"]));
        assert_eq!(json["senderIp"], "10.0.0.40");
    }

    #[test]
    fn test_failure_keeps_request_context() {
        let request = Envelope::new(Sender::App, "clear_ram").with_target("10.0.0.9");
        let reply = request.failure("Device 10.0.0.9 not found");

        assert_eq!(reply.sender, Sender::Manager);
        assert_eq!(reply.command, "clear_ram");
        assert_eq!(reply.target.as_deref(), Some("10.0.0.9"));
        assert_eq!(reply.result, Some(json!("Device 10.0.0.9 not found")));
    }

    #[test]
    fn test_register_result_object_decodes() {
        let text = r#"{"sender":"agent","command":"register","result":{"site":"lab","bvType":"JcmUba"}}"#;
        let env = Envelope::from_json(text).unwrap();
        assert!(env.is_command(command::REGISTER));
        assert_eq!(env.result.unwrap()["site"], "lab");
    }

    #[test]
    fn test_display() {
        let env = Envelope::manager(command::PING).with_target("10.0.0.5");
        assert_eq!(env.to_string(), "manager:ping -> 10.0.0.5");
    }
}
