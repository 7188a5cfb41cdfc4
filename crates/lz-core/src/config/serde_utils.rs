//! Shared serde helpers for configuration
//!
//! Durations are written as plain integers in TOML: whole seconds for
//! cadences and timeouts, milliseconds where sub-second values matter.

/// Serialize a `Duration` as whole seconds (u64)
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "lz_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serialize a `Duration` as milliseconds (u64)
pub mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cadence {
        #[serde(with = "duration_secs")]
        interval: Duration,
        #[serde(with = "duration_millis")]
        pacing: Duration,
    }

    #[test]
    fn test_serialize_units() {
        let cadence = Cadence {
            interval: Duration::from_secs(5),
            pacing: Duration::from_millis(250),
        };
        let json = serde_json::to_string(&cadence).unwrap();
        assert_eq!(json, r#"{"interval":5,"pacing":250}"#);
    }

    #[test]
    fn test_deserialize_units() {
        let cadence: Cadence = toml::from_str("interval = 2\npacing = 1500").unwrap();
        assert_eq!(cadence.interval, Duration::from_secs(2));
        assert_eq!(cadence.pacing, Duration::from_millis(1500));
    }
}
