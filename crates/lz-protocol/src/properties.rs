//! Agent-reported device properties
//!
//! An agent answers the broker's `register` request with a JSON object of
//! free-form properties read from its local configuration. The broker only
//! understands a fixed set of them; every recognised key is applied through
//! a name → setter table, and everything else is collected and ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Typed view of the properties a terminal reports on registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperties {
    /// Physical site (e.g. `lab`, `warehouse`)
    pub site: Option<String>,
    /// Bill validator model
    pub bv_type: Option<String>,
    /// Cabinet / device type
    pub device_type: Option<String>,
    /// Agent software version
    pub version: Option<String>,
}

type Setter = fn(&mut DeviceProperties, String);

fn set_site(props: &mut DeviceProperties, value: String) {
    props.site = Some(value);
}

fn set_bv_type(props: &mut DeviceProperties, value: String) {
    props.bv_type = Some(value);
}

fn set_device_type(props: &mut DeviceProperties, value: String) {
    props.device_type = Some(value);
}

fn set_version(props: &mut DeviceProperties, value: String) {
    props.version = Some(value);
}

/// Recognised wire keys. The snake_case spellings are what terminal
/// firmware writes into its local config file.
const FIELDS: &[(&str, Setter)] = &[
    ("site", set_site),
    ("bvType", set_bv_type),
    ("bv_type", set_bv_type),
    ("deviceType", set_device_type),
    ("type", set_device_type),
    ("version", set_version),
    ("lazy_egm_version", set_version),
];

fn setter_for(key: &str) -> Option<Setter> {
    FIELDS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, setter)| *setter)
}

/// Result of applying a property map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedProperties {
    /// The recognised properties
    pub properties: DeviceProperties,
    /// Keys that were present but not recognised, sorted
    pub ignored: Vec<String>,
}

impl DeviceProperties {
    /// Version reported when the agent did not send one
    pub const UNKNOWN_VERSION: &'static str = "unknown";

    /// Apply every recognised key of `map`.
    ///
    /// Strings are taken as-is, numbers and booleans are stringified,
    /// nulls are skipped. Unknown keys and nested values are reported in
    /// [`ParsedProperties::ignored`].
    pub fn from_map(map: &Map<String, Value>) -> ParsedProperties {
        let mut parsed = ParsedProperties::default();

        for (key, value) in map {
            let text = match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                Value::Null => continue,
                Value::Array(_) | Value::Object(_) => None,
            };

            match (setter_for(key), text) {
                (Some(setter), Some(text)) => setter(&mut parsed.properties, text),
                _ => parsed.ignored.push(key.clone()),
            }
        }

        parsed.ignored.sort();
        if !parsed.ignored.is_empty() {
            tracing::debug!("Ignoring unknown device properties: {:?}", parsed.ignored);
        }

        parsed
    }

    /// Decode the `result` of a `register` envelope.
    ///
    /// A missing result yields empty properties; anything other than a
    /// JSON object is rejected.
    pub fn from_result(result: Option<&Value>) -> Result<ParsedProperties, ProtocolError> {
        match result {
            None | Some(Value::Null) => Ok(ParsedProperties::default()),
            Some(Value::Object(map)) => Ok(Self::from_map(map)),
            Some(other) => Err(ProtocolError::InvalidField {
                field: "result",
                reason: format!("expected an object of device properties, got {}", other),
            }),
        }
    }

    /// Whether no recognised property was reported
    pub fn is_empty(&self) -> bool {
        self.site.is_none()
            && self.bv_type.is_none()
            && self.device_type.is_none()
            && self.version.is_none()
    }

    /// Reported version, or [`Self::UNKNOWN_VERSION`]
    pub fn version_or_unknown(&self) -> &str {
        self.version.as_deref().unwrap_or(Self::UNKNOWN_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_camel_case_keys() {
        let parsed = DeviceProperties::from_map(&map(json!({
            "site": "lab",
            "bvType": "JcmUba",
            "deviceType": "vertical/1600",
            "version": "1.0.1"
        })));

        assert!(parsed.ignored.is_empty());
        assert_eq!(parsed.properties.site.as_deref(), Some("lab"));
        assert_eq!(parsed.properties.bv_type.as_deref(), Some("JcmUba"));
        assert_eq!(parsed.properties.device_type.as_deref(), Some("vertical/1600"));
        assert_eq!(parsed.properties.version_or_unknown(), "1.0.1");
    }

    #[test]
    fn test_firmware_spellings() {
        let parsed = DeviceProperties::from_map(&map(json!({
            "bv_type": "MeiCashflow",
            "type": "slant",
            "lazy_egm_version": "1.0.0"
        })));

        assert_eq!(parsed.properties.bv_type.as_deref(), Some("MeiCashflow"));
        assert_eq!(parsed.properties.device_type.as_deref(), Some("slant"));
        assert_eq!(parsed.properties.version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_unknown_keys_are_ignored_sorted() {
        let parsed = DeviceProperties::from_map(&map(json!({
            "site": "lab",
            "zeta": 1,
            "ip": "10.0.0.5",
            "nested": {"a": 1}
        })));

        assert_eq!(parsed.properties.site.as_deref(), Some("lab"));
        assert_eq!(parsed.ignored, vec!["ip", "nested", "zeta"]);
    }

    #[test]
    fn test_scalar_values_are_stringified() {
        let parsed = DeviceProperties::from_map(&map(json!({
            "site": 12,
            "version": null
        })));

        assert_eq!(parsed.properties.site.as_deref(), Some("12"));
        assert!(parsed.properties.version.is_none());
        assert_eq!(parsed.properties.version_or_unknown(), "unknown");
    }

    #[test]
    fn test_from_result() {
        assert!(DeviceProperties::from_result(None)
            .unwrap()
            .properties
            .is_empty());

        let parsed = DeviceProperties::from_result(Some(&json!({"site": "lab"}))).unwrap();
        assert!(!parsed.properties.is_empty());

        assert!(matches!(
            DeviceProperties::from_result(Some(&json!("site=lab&bv_type=JcmUba"))),
            Err(ProtocolError::InvalidField { field: "result", .. })
        ));
    }
}
