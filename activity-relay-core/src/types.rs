//! Core domain types for activity-relay
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | One captured activity record (page open/close, interaction sample, active period) |
//! | **StoredEvent** | An event plus the ordinal the local store assigned to it |
//! | **Batch** | A bounded, ordered group of events packaged for one delivery attempt |
//! | **Fingerprint** | Correlation key for repeated attempts of the same batch |
//! | **Collector** | The remote endpoint receiving batches |
//!
//! Events are free-form JSON objects. The relay only looks at a handful of
//! well-known keys (`type`, `ts`, `url`, `duration`, `event_id`); everything
//! else is carried through untouched.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// Keys starting with this prefix are internal to the relay and never leave it.
pub const INTERNAL_KEY_PREFIX: char = '_';

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================
// Event identity
// ============================================

/// Store-assigned ordinal. Unique, increasing, never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================
// Event vocabulary
// ============================================

/// Event types emitted by the known producers.
///
/// The relay does not validate `type`; this enum only names the values that
/// statistics and docs care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PageOpen,
    PageClose,
    VisibilityChange,
    Focus,
    Blur,
    Click,
    Scroll,
    Keydown,
    /// Foreground time on a page, carries `duration` in ms
    ActivePeriod,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PageOpen => "page_open",
            EventKind::PageClose => "page_close",
            EventKind::VisibilityChange => "visibility_change",
            EventKind::Focus => "focus",
            EventKind::Blur => "blur",
            EventKind::Click => "click",
            EventKind::Scroll => "scroll",
            EventKind::Keydown => "keydown",
            EventKind::ActivePeriod => "active_period",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "page_open" => Ok(EventKind::PageOpen),
            "page_close" => Ok(EventKind::PageClose),
            "visibility_change" => Ok(EventKind::VisibilityChange),
            "focus" => Ok(EventKind::Focus),
            "blur" => Ok(EventKind::Blur),
            "click" => Ok(EventKind::Click),
            "scroll" => Ok(EventKind::Scroll),
            "keydown" => Ok(EventKind::Keydown),
            "active_period" => Ok(EventKind::ActivePeriod),
            _ => Err(format!("unknown event type: {}", s)),
        }
    }
}

// ============================================
// Event records
// ============================================

/// A producer-supplied event: an arbitrary JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventRecord(Map<String, Value>);

impl EventRecord {
    /// Wrap a JSON value, rejecting anything that is not an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::Producer(format!(
                "event must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parse a JSON document into a record.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Producer(format!("event is not valid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// The `type` tag, if present.
    pub fn event_type(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// The `type` tag as a known kind.
    pub fn kind(&self) -> Option<EventKind> {
        self.event_type().and_then(|t| t.parse().ok())
    }

    /// Producer timestamp (ms since epoch).
    pub fn ts(&self) -> Option<i64> {
        self.0.get("ts").and_then(Value::as_i64)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Remove every relay-internal key in place.
    pub fn strip_internal_keys(&mut self) {
        self.0.retain(|key, _| !key.starts_with(INTERNAL_KEY_PREFIX));
    }

    /// Copy of this record without relay-internal keys.
    pub fn without_internal_keys(&self) -> Self {
        let mut copy = self.clone();
        copy.strip_internal_keys();
        copy
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }
}

impl From<Map<String, Value>> for EventRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// An event as persisted in the local store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    /// Store ordinal
    pub id: EventId,
    /// Producer fields plus the relay's receipt stamp
    #[serde(flatten)]
    pub record: EventRecord,
}

// ============================================
// Batches
// ============================================

/// Identity of the sending agent, attached to every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Agent identity string
    #[serde(rename = "ua")]
    pub agent: String,
    /// Relay software version
    #[serde(rename = "ext_version")]
    pub version: String,
}

impl ClientInfo {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Delivery payload. Immutable once assembled.
///
/// Serializes to the collector wire format:
/// `{ "batch_id": ..., "client": { "ua", "ext_version" }, "events": [...] }`.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    batch_id: String,
    client: ClientInfo,
    events: Vec<EventRecord>,
    /// Every store id read for this batch, including discarded records
    #[serde(skip)]
    member_ids: Vec<EventId>,
}

impl Batch {
    /// Build a batch stamped with the current time.
    pub fn new(client: ClientInfo, events: Vec<EventRecord>, member_ids: Vec<EventId>) -> Self {
        let batch_id = format!(
            "batch-{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        Self {
            batch_id,
            client,
            events,
            member_ids,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    /// Store ids to delete once this batch is delivered.
    pub fn member_ids(&self) -> &[EventId] {
        &self.member_ids
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn fingerprint(&self) -> BatchFingerprint {
        BatchFingerprint::from_ids(&self.member_ids)
    }

    /// Wire encoding shared by both transports.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Deterministic key over the ordered member ids of a batch.
///
/// Only correlates repeated attempts of the *same* composition: a batch
/// re-assembled with different members gets a different fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchFingerprint(String);

impl BatchFingerprint {
    pub fn from_ids(ids: &[EventId]) -> Self {
        let key = ids
            .iter()
            .map(|id| id.0.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short digest for log lines (16 hex chars).
    pub fn short(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..8])
    }
}

impl fmt::Display for BatchFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> EventRecord {
        EventRecord::from_value(value).unwrap()
    }

    #[test]
    fn test_record_rejects_non_objects() {
        assert!(EventRecord::from_value(json!([1, 2])).is_err());
        assert!(EventRecord::from_value(json!("click")).is_err());
        assert!(EventRecord::from_json("{not json").is_err());
        assert!(EventRecord::from_json(r#"{"type":"click"}"#).is_ok());
    }

    #[test]
    fn test_strip_internal_keys() {
        let rec = record(json!({"_id": 4, "_retry": true, "type": "click"}));
        let stripped = rec.without_internal_keys();
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped.event_type(), Some("click"));
        // The original is untouched
        assert_eq!(rec.len(), 3);

        let only_internal = record(json!({"_id": 9}));
        assert!(only_internal.without_internal_keys().is_empty());
    }

    #[test]
    fn test_event_kind_round_trip() {
        for kind in [
            EventKind::PageOpen,
            EventKind::ActivePeriod,
            EventKind::VisibilityChange,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("hover".parse::<EventKind>().is_err());

        let rec = record(json!({"type": "active_period", "duration": 1200}));
        assert_eq!(rec.kind(), Some(EventKind::ActivePeriod));
    }

    #[test]
    fn test_fingerprint_is_order_sensitive_concatenation() {
        let fp = BatchFingerprint::from_ids(&[EventId(1), EventId(2), EventId(10)]);
        assert_eq!(fp.as_str(), "1,2,10");
        assert_eq!(fp.short().len(), 16);

        let same = BatchFingerprint::from_ids(&[EventId(1), EventId(2), EventId(10)]);
        assert_eq!(fp, same);
        assert_eq!(fp.short(), same.short());

        let grown = BatchFingerprint::from_ids(&[EventId(1), EventId(2), EventId(10), EventId(11)]);
        assert_ne!(fp, grown);
    }

    #[test]
    fn test_batch_wire_format() {
        let batch = Batch::new(
            ClientInfo::new("test-agent"),
            vec![record(json!({"type": "focus", "ts": 5}))],
            vec![EventId(7)],
        );
        let wire: Value = serde_json::from_str(&batch.to_json().unwrap()).unwrap();

        assert!(wire["batch_id"].as_str().unwrap().starts_with("batch-"));
        assert_eq!(wire["client"]["ua"], "test-agent");
        assert_eq!(wire["client"]["ext_version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(wire["events"][0]["type"], "focus");
        // Store ids never go over the wire
        assert!(wire.get("member_ids").is_none());
        assert_eq!(batch.fingerprint().as_str(), "7");
    }

    #[test]
    fn test_stored_event_serializes_flat() {
        let stored = StoredEvent {
            id: EventId(3),
            record: record(json!({"type": "blur", "url": "https://a.test", "received_ts": 99})),
        };
        let value = serde_json::to_value(&stored).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["received_ts"], 99);
        assert_eq!(value["type"], "blur");
        assert_eq!(value["url"], "https://a.test");
    }
}
