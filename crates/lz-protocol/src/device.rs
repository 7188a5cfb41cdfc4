//! Device status and the per-device snapshot sent to consoles

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::envelope::{command, Envelope};
use crate::error::ProtocolError;

/// Liveness of a registered device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Answered (or was sent) a recent keepalive
    Online,
    /// Connection lost or keepalive failed
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "Online"),
            DeviceStatus::Offline => write!(f, "Offline"),
        }
    }
}

/// Snapshot of one registry entry, as streamed on `device_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device address
    pub address: String,
    /// Numeric id (last address octet)
    pub id: u8,
    /// Reported site
    pub site: Option<String>,
    /// Reported bill validator model
    pub bv_type: Option<String>,
    /// Reported device type
    pub device_type: Option<String>,
    /// Current liveness
    pub status: DeviceStatus,
    /// Reported agent software version
    pub version: String,
    /// Last time the device proved alive (Unix ms)
    pub last_seen: u64,
}

impl DeviceInfo {
    /// Wrap this snapshot in the broker's `device_info` reply
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let result = serde_json::to_value(self)?;
        Ok(Envelope::manager(command::DEVICE_INFO).with_result(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Sender;

    fn sample() -> DeviceInfo {
        DeviceInfo {
            address: "10.0.0.5".to_string(),
            id: 5,
            site: Some("lab".to_string()),
            bv_type: Some("JcmUba".to_string()),
            device_type: None,
            status: DeviceStatus::Online,
            version: "unknown".to_string(),
            last_seen: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_snapshot_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        for key in ["address", "id", "site", "bvType", "deviceType", "status"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["status"], "Online");
        assert_eq!(json["lastSeen"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_snapshot_envelope() {
        let env = sample().to_envelope().unwrap();
        assert_eq!(env.sender, Sender::Manager);
        assert_eq!(env.command, "device_info");
        assert_eq!(env.result.unwrap()["address"], "10.0.0.5");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DeviceStatus::Online.to_string(), "Online");
        assert_eq!(DeviceStatus::Offline.to_string(), "Offline");
    }
}
