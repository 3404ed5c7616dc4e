//! The immutable event value passed from publisher to subscribers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Source module name used when an event is emitted outside a module.
pub const UNKNOWN_SOURCE: &str = "unknown";
/// Version stamped on events emitted outside a module.
pub const UNVERSIONED: &str = "0.0.0";

/// Metadata stamped onto every [`Event`] at emission time.
///
/// Once constructed, a value is never mutated — `Event` and `EventMeta`
/// are handed to handlers by shared reference only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Milliseconds since the Unix epoch at the moment of emission.
    pub timestamp_ms: i64,
    /// The emitting module's name, or [`UNKNOWN_SOURCE`].
    pub source: String,
    /// The emitting module's version, or [`UNVERSIONED`].
    pub version: String,
}

impl EventMeta {
    /// Stamp the current wall-clock time for `source`/`version`.
    pub fn now(source: impl Into<String>, version: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            source: source.into(),
            version: version.into(),
        }
    }
}

/// An immutable event: a type tag, an opaque payload, and metadata.
///
/// `detail` is payload-agnostic — the broker imposes no schema on it. A
/// `serde_json::Value` is used as the dynamic-map representation of the
/// source's untyped payload (see DESIGN.md).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The event type tag, e.g. `"midi:note-on"`. Matched by exact,
    /// case-sensitive string equality.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The opaque payload. Handlers must treat this as read-only.
    pub detail: serde_json::Value,
    /// Timestamp/source/version metadata.
    pub meta: EventMeta,
}

impl Event {
    pub(crate) fn new(
        event_type: impl Into<String>,
        detail: serde_json::Value,
        source: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            detail,
            meta: EventMeta::now(source, version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_meta_defaults_are_stable() {
        assert_eq!(UNKNOWN_SOURCE, "unknown");
        assert_eq!(UNVERSIONED, "0.0.0");
    }

    #[test]
    fn event_carries_exact_values() {
        let detail = serde_json::json!({ "note": 60 });
        let event = Event::new("midi:note-on", detail.clone(), "Piano", "1.2.3");
        assert_eq!(event.event_type, "midi:note-on");
        assert_eq!(event.detail, detail);
        assert_eq!(event.meta.source, "Piano");
        assert_eq!(event.meta.version, "1.2.3");
        assert!(event.meta.timestamp_ms > 0);
    }

    #[test]
    fn serializes_to_the_stable_envelope_shape() {
        let event = Event::new("x", serde_json::json!(null), UNKNOWN_SOURCE, UNVERSIONED);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "x");
        assert!(json.get("detail").is_some());
        assert!(json["meta"].get("timestamp_ms").is_some());
        assert_eq!(json["meta"]["source"], "unknown");
        assert_eq!(json["meta"]["version"], "0.0.0");
    }
}
