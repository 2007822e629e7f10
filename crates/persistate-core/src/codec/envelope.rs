//! Versioned envelope
//!
//! Persisted values are wrapped as `{value, version, timestamp}` so that
//! later releases know which migrations to run.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{Codec, CodecError};

/// Version assumed for payloads that carry none
pub const DEFAULT_VERSION: u32 = 1;

/// Versioned wrapper around a persisted value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub value: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Milliseconds since the Unix epoch at write time
    #[serde(default)]
    pub timestamp: i64,
}

impl<T> Envelope<T> {
    pub fn new(value: T, version: Option<u32>) -> Self {
        Self {
            value,
            version,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The stored version, or [`DEFAULT_VERSION`] when none was recorded
    pub fn version_or_default(&self) -> u32 {
        self.version.unwrap_or(DEFAULT_VERSION)
    }
}

/// Wrap `value` in an envelope and encode it
pub fn serialize<T: Serialize>(
    value: &T,
    version: Option<u32>,
    codec: &dyn Codec,
) -> Result<String, CodecError> {
    let value = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    let envelope = serde_json::to_value(Envelope::new(value, version))
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    codec.encode(&envelope)
}

/// Decode a stored payload
///
/// Returns `None` for malformed input. Anything that decodes to an object
/// with a `value` field is read as an envelope; any other decoded value is
/// a payload written before envelopes existed and is returned whole with
/// version [`DEFAULT_VERSION`]. This detection is a compatibility shim for
/// that older data only and must stay exactly as it is.
pub fn deserialize(raw: &str, codec: &dyn Codec) -> Option<Envelope<Value>> {
    let parsed = match codec.decode(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Ignoring stored payload: {}", e);
            return None;
        }
    };

    match parsed {
        Value::Object(mut map) if map.contains_key("value") => {
            let value = map.remove("value").unwrap_or(Value::Null);
            let version = map
                .get("version")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok());
            let timestamp = map.get("timestamp").and_then(Value::as_i64).unwrap_or(0);
            Some(Envelope {
                value,
                version,
                timestamp,
            })
        }
        legacy => Some(Envelope {
            value: legacy,
            version: Some(DEFAULT_VERSION),
            timestamp: 0,
        }),
    }
}

/// Decode a stored payload into a concrete type
pub fn deserialize_into<T: DeserializeOwned>(raw: &str, codec: &dyn Codec) -> Option<Envelope<T>> {
    let envelope = deserialize(raw, codec)?;
    match serde_json::from_value(envelope.value) {
        Ok(value) => Some(Envelope {
            value,
            version: envelope.version,
            timestamp: envelope.timestamp,
        }),
        Err(e) => {
            warn!("Stored payload does not match the expected shape: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        font_size: u32,
    }

    #[test]
    fn test_roundtrip_keeps_value_and_version() {
        let value = json!({"todos": [{"id": 1, "done": false}], "filter": "all"});

        let raw = serialize(&value, Some(4), &JsonCodec).unwrap();
        let envelope = deserialize(&raw, &JsonCodec).unwrap();

        assert_eq!(envelope.value, value);
        assert_eq!(envelope.version, Some(4));
        assert!(envelope.timestamp > 0);
    }

    #[test]
    fn test_legacy_payload_defaults_to_version_one() {
        let envelope = deserialize(r#"{"name":"x"}"#, &JsonCodec).unwrap();

        assert_eq!(envelope.value, json!({"name": "x"}));
        assert_eq!(envelope.version, Some(1));
    }

    #[test]
    fn test_legacy_non_object_payload() {
        let envelope = deserialize("[1,2,3]", &JsonCodec).unwrap();
        assert_eq!(envelope.value, json!([1, 2, 3]));
        assert_eq!(envelope.version_or_default(), 1);
    }

    #[test]
    fn test_envelope_without_version() {
        let envelope = deserialize(r#"{"value":{"a":1},"timestamp":5}"#, &JsonCodec).unwrap();

        assert_eq!(envelope.value, json!({"a": 1}));
        assert_eq!(envelope.version, None);
        assert_eq!(envelope.version_or_default(), DEFAULT_VERSION);
        assert_eq!(envelope.timestamp, 5);
    }

    #[test]
    fn test_malformed_payload_is_none() {
        assert!(deserialize("{\"value\":", &JsonCodec).is_none());
        assert!(deserialize("", &JsonCodec).is_none());
    }

    #[test]
    fn test_typed_deserialize() {
        let settings = Settings {
            theme: "dark".to_string(),
            font_size: 14,
        };

        let raw = serialize(&settings, Some(2), &JsonCodec).unwrap();
        let envelope: Envelope<Settings> = deserialize_into(&raw, &JsonCodec).unwrap();
        assert_eq!(envelope.value, settings);

        let wrong_shape: Option<Envelope<Settings>> = deserialize_into("[1]", &JsonCodec);
        assert!(wrong_shape.is_none());
    }
}
