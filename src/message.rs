//! Message types flowing through the pipeline
//!
//! A broker publish arrives as a [`RawMessage`], is classified into a
//! [`Telemetry`], and leaves as a [`Reading`] once the device id has been
//! resolved to an integer. The raw body uses `Bytes` so the hand-off from the
//! MQTT event loop is a refcount bump, not a copy.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// JSON object payload carried by a sensor message
pub type Payload = Map<String, Value>;

/// An MQTT publish as received, before classification
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub body: Bytes,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Stamp a freshly received publish with the current time.
    pub fn new(topic: impl Into<String>, body: Bytes) -> Self {
        Self {
            topic: topic.into(),
            body,
            received_at: Utc::now(),
        }
    }
}

/// One decoded, topic-classified message awaiting persistence
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub gateway_id: String,
    /// Device id exactly as it appeared in the topic; parsed later
    pub device_id_raw: String,
    pub topic: String,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

/// The persisted form of a telemetry datum, as the control plane accepts it
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    #[serde(rename = "pi_id")]
    pub gateway_id: String,
    pub device_id: i64,
    pub ts: DateTime<Utc>,
    pub payload: Payload,
}

/// Decode a message body into a JSON object payload.
///
/// Anything that is not a JSON object (including an empty body and binary
/// garbage) is preserved under a `"raw"` key so ingestion still proceeds.
pub fn decode_payload(body: &[u8]) -> Payload {
    match serde_json::from_slice::<Payload>(body) {
        Ok(map) => map,
        Err(_) => {
            let mut map = Map::new();
            map.insert(
                "raw".to_string(),
                Value::String(String::from_utf8_lossy(body).into_owned()),
            );
            map
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn decode_json_object() {
        let payload = decode_payload(br#"{"temp": 22.5, "unit": "C"}"#);
        assert_eq!(payload.get("temp"), Some(&Value::from(22.5)));
        assert_eq!(payload.get("unit"), Some(&Value::from("C")));
    }

    #[test]
    fn decode_invalid_json_falls_back_to_raw() {
        let payload = decode_payload(b"not json at all");
        assert_eq!(payload.get("raw"), Some(&Value::from("not json at all")));
        assert_eq!(payload.len(), 1);
    }

    #[test]
    fn decode_empty_body_is_raw_empty_string() {
        let payload = decode_payload(b"");
        assert_eq!(payload.get("raw"), Some(&Value::from("")));
    }

    #[test]
    fn decode_non_object_json_falls_back_to_raw() {
        // A bare array or number is valid JSON but not an object payload
        let payload = decode_payload(b"[1, 2, 3]");
        assert_eq!(payload.get("raw"), Some(&Value::from("[1, 2, 3]")));
    }

    #[test]
    fn reading_serializes_to_control_plane_shape() {
        let reading = Reading {
            gateway_id: "pi_001".to_string(),
            device_id: 42,
            ts: "2025-01-01T00:00:00Z".parse().unwrap(),
            payload: decode_payload(br#"{"v": 1}"#),
        };

        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["pi_id"], "pi_001");
        assert_eq!(json["device_id"], 42);
        assert_eq!(json["ts"], "2025-01-01T00:00:00Z");
        assert_eq!(json["payload"]["v"], 1);
    }
}
