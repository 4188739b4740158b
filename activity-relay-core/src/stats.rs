//! Summary statistics over the locally stored events

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{EventKind, StoredEvent};

const UNKNOWN: &str = "unknown";

/// Counts and active time computed from the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivityStats {
    pub total_events: usize,
    pub events_by_type: BTreeMap<String, usize>,
    /// Milliseconds of `active_period` time per page URL
    pub active_time_by_url: BTreeMap<String, i64>,
}

impl ActivityStats {
    pub fn compute(events: &[StoredEvent]) -> Self {
        let mut stats = Self::default();

        for event in events {
            let record = &event.record;
            stats.total_events += 1;

            let kind = record.event_type().unwrap_or(UNKNOWN);
            *stats.events_by_type.entry(kind.to_string()).or_default() += 1;

            if record.kind() != Some(EventKind::ActivePeriod) {
                continue;
            }
            let Some(duration) = record
                .get("duration")
                .and_then(|v| v.as_f64())
                .filter(|d| d.is_finite())
            else {
                continue;
            };

            let url = record
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or(UNKNOWN);
            *stats.active_time_by_url.entry(url.to_string()).or_default() +=
                duration.round() as i64;
        }

        stats
    }

    /// Sum of active time across all URLs, in milliseconds
    pub fn total_active_ms(&self) -> i64 {
        self.active_time_by_url.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventId, EventRecord};
    use serde_json::json;

    fn stored(id: i64, value: serde_json::Value) -> StoredEvent {
        StoredEvent {
            id: EventId(id),
            record: EventRecord::from_value(value).unwrap(),
        }
    }

    #[test]
    fn test_compute_stats() {
        let events = vec![
            stored(1, json!({"type": "page_open", "url": "https://a.example"})),
            stored(2, json!({"type": "active_period", "url": "https://a.example", "duration": 1500})),
            stored(3, json!({"type": "active_period", "url": "https://a.example", "duration": 500})),
            stored(4, json!({"type": "active_period", "duration": 250})),
            stored(5, json!({"type": "active_period", "url": "https://b.example", "duration": "long"})),
            stored(6, json!({"ts": 1})),
        ];

        let stats = ActivityStats::compute(&events);
        assert_eq!(stats.total_events, 6);
        assert_eq!(stats.events_by_type["active_period"], 4);
        assert_eq!(stats.events_by_type["page_open"], 1);
        assert_eq!(stats.events_by_type["unknown"], 1);
        assert_eq!(stats.active_time_by_url["https://a.example"], 2000);
        assert_eq!(stats.active_time_by_url["unknown"], 250);
        assert!(!stats.active_time_by_url.contains_key("https://b.example"));
        assert_eq!(stats.total_active_ms(), 2250);
    }

    #[test]
    fn test_empty_store_stats() {
        let stats = ActivityStats::compute(&[]);
        assert_eq!(stats, ActivityStats::default());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_events"], 0);
    }
}
