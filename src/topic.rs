//! Sensor topic classifier
//!
//! Pure function: no IO, no state. The accepted shape is
//! `<prefix>/<gateway_id>/<device_id>/<metric>` with optional further
//! segments. Segments are compared byte-exact; no trimming, no case folding.

/// Placeholder used in diagnostics when a topic is too short to carry an id
const UNKNOWN: &str = "unknown";

/// Result of classifying a topic string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicClass {
    /// Topic matched the sensor shape
    Accepted {
        gateway_id: String,
        /// Second id segment verbatim; integer parsing happens at flush time
        device_id_raw: String,
        /// Informational only, not persisted
        metric: String,
    },
    /// Topic did not match; ids are best-effort so diagnostics can still be
    /// addressed to the originating device
    Rejected {
        reason: String,
        gateway_id: String,
        device_id_raw: String,
    },
}

/// Classify a topic against the configured sensor prefix.
pub fn classify(prefix: &str, topic: &str) -> TopicClass {
    let segments: Vec<&str> = topic.split('/').collect();

    let well_formed = segments.len() >= 4
        && segments[0] == prefix
        && segments[1..4].iter().all(|s| !s.is_empty());

    if well_formed {
        return TopicClass::Accepted {
            gateway_id: segments[1].to_string(),
            device_id_raw: segments[2].to_string(),
            metric: segments[3].to_string(),
        };
    }

    let best_effort = |idx: usize| -> String {
        segments
            .get(idx)
            .filter(|s| !s.is_empty())
            .map_or_else(|| UNKNOWN.to_string(), |s| s.to_string())
    };

    TopicClass::Rejected {
        reason: format!(
            "invalid topic format: {topic}, expected: {prefix}/<gateway_id>/<device_id>/<metric>"
        ),
        gateway_id: best_effort(1),
        device_id_raw: best_effort(2),
    }
}
