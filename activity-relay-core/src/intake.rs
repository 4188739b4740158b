//! Producer boundary: turns a submitted JSON value into a storable record.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{now_millis, EventRecord};

/// Validate and stamp one submitted event.
///
/// Rejects non-objects and records that carry nothing but internal keys.
/// Stamps `received_ts`, adds a random `event_id` when the producer did not
/// supply one, and fills a missing `ts` with the receipt time.
pub fn prepare(value: Value) -> Result<EventRecord> {
    let mut record = EventRecord::from_value(value)?;

    if record.without_internal_keys().is_empty() {
        return Err(Error::Producer(
            "event has no fields besides internal keys".to_string(),
        ));
    }

    let received_ts = now_millis();
    record.insert("received_ts", received_ts);

    if !record.contains_key("event_id") {
        record.insert("event_id", uuid::Uuid::new_v4().to_string());
    }
    if !record.contains_key("ts") {
        record.insert("ts", received_ts);
    }

    Ok(record)
}
