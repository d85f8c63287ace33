use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Serializes Duration as seconds
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    duration.as_secs_f64().serialize(serializer)
}

/// Deserializes Duration from seconds
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(serde::de::Error::custom(format!("invalid duration: {}", secs)));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Serializes an optional Duration as seconds or null
pub fn serialize_opt_duration<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    duration.map(|d| d.as_secs_f64()).serialize(serializer)
}

/// Deserializes an optional Duration from seconds or null
pub fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<f64>::deserialize(deserializer)? {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
        Some(secs) => Err(serde::de::Error::custom(format!("invalid duration: {}", secs))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProtocolConfig;

    #[test]
    fn test_duration_serialization() {
        #[derive(Serialize, Deserialize)]
        struct Test {
            #[serde(serialize_with = "serialize_duration")]
            #[serde(deserialize_with = "deserialize_duration")]
            timeout: Duration,
        }

        let original = Test {
            timeout: Duration::from_millis(250),
        };

        let serialized = serde_json::to_string(&original).unwrap();
        assert_eq!(serialized, r#"{"timeout":0.25}"#);
        let deserialized: Test = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.timeout, original.timeout);
    }

    #[test]
    fn test_negative_duration_rejected() {
        #[derive(Deserialize)]
        struct Test {
            #[serde(deserialize_with = "deserialize_duration")]
            #[allow(dead_code)]
            timeout: Duration,
        }

        assert!(serde_json::from_str::<Test>(r#"{"timeout":-1.0}"#).is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = ProtocolConfig::default();
        config.expire_after = Some(Duration::from_secs(30));

        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: ProtocolConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.expire_after, Some(Duration::from_secs(30)));
        assert_eq!(deserialized.call_timeout, config.call_timeout);
        assert_eq!(deserialized.broadcast_addr, config.broadcast_addr);
    }

    #[test]
    fn test_config_without_expiry() {
        let json = r#"{
            "broadcast_addr": "127.0.0.1:54321",
            "listen_port": 0,
            "call_timeout": 0.2,
            "max_retries": 2,
            "refresh_interval": 5.0
        }"#;
        let config: ProtocolConfig = serde_json::from_str(json).unwrap();
        assert!(config.expire_after.is_none());
        assert!(config.token_file.is_none());
        assert_eq!(config.max_retries, 2);
    }
}
