//! Event store repository
//!
//! Provides the queue operations the delivery pipeline runs against.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::types::{now_millis, EventId, EventRecord, StoredEvent};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed event queue
///
/// Appends may interleave with an in-flight read-then-delete cycle: each call
/// takes the connection lock only for its own statement(s), so events appended
/// mid-cycle are simply picked up by the next read.
pub struct EventStore {
    conn: Mutex<Connection>,
    max_events: u64,
}

impl EventStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL so CLI readers and the running agent don't block each other
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        conn.busy_timeout(config.busy_timeout())?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_events: config.max_events,
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_events: StoreConfig::default().max_events,
        })
    }

    /// Override the retention bound
    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events = max_events;
        self
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        super::schema::run_migrations(&conn)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("event store lock poisoned".to_string()))
    }

    // ============================================
    // Queue operations
    // ============================================

    /// Persist one event and return its fresh id.
    ///
    /// Every call creates a distinct row; there is no deduplication. If the
    /// store grows past its retention bound the oldest rows are evicted.
    pub fn append(&self, record: &EventRecord) -> Result<EventId> {
        let conn = self.connection()?;
        let received_ts = record
            .get("received_ts")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(now_millis);

        conn.execute(
            "INSERT INTO events (event_type, ts, received_ts, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.event_type(),
                record.ts(),
                received_ts,
                record.to_json()?,
            ],
        )?;
        let id = EventId(conn.last_insert_rowid());

        // The row is stored either way; eviction catches up on a later append
        match Self::prune_locked(&conn, self.max_events) {
            Ok(0) => {}
            Ok(evicted) => tracing::warn!(
                evicted,
                max_events = self.max_events,
                "Event store over capacity, evicted oldest events"
            ),
            Err(e) => tracing::warn!(
                id = %id,
                error = %e,
                "Failed to evict events over capacity"
            ),
        }

        Ok(id)
    }

    /// Up to `limit` oldest events in ascending id order. Does not delete.
    pub fn read_oldest(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT id, body FROM events ORDER BY id ASC LIMIT ?1")?;

        let events = stmt
            .query_map(params![limit as i64], Self::row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Every stored event in ascending id order.
    pub fn read_all(&self) -> Result<Vec<StoredEvent>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT id, body FROM events ORDER BY id ASC")?;

        let events = stmt
            .query_map([], Self::row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Delete exactly the given ids, one statement per id.
    ///
    /// A failure on one id does not stop the others. Returns the ids that
    /// could not be removed; those stay eligible for redelivery. Ids that were
    /// already gone (evicted, or deleted by an earlier cycle) count as removed.
    pub fn delete_by_ids(&self, ids: &[EventId]) -> Vec<EventId> {
        if ids.is_empty() {
            return Vec::new();
        }

        let conn = match self.connection() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, count = ids.len(), "Cannot delete delivered events");
                return ids.to_vec();
            }
        };

        let mut stmt = match conn.prepare_cached("DELETE FROM events WHERE id = ?1") {
            Ok(stmt) => stmt,
            Err(e) => {
                tracing::error!(error = %e, count = ids.len(), "Cannot prepare event delete");
                return ids.to_vec();
            }
        };

        let mut failed = Vec::new();
        for id in ids {
            match stmt.execute(params![id.0]) {
                Ok(0) => tracing::debug!(id = %id, "Event already removed"),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Failed to delete event");
                    failed.push(*id);
                }
            }
        }

        failed
    }

    /// Number of stored events
    pub fn count(&self) -> Result<u64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Evict oldest events until at most `max_events` remain.
    ///
    /// Returns the number of evicted events.
    pub fn prune_to(&self, max_events: u64) -> Result<usize> {
        let conn = self.connection()?;
        Self::prune_locked(&conn, max_events)
    }

    fn prune_locked(conn: &Connection, max_events: u64) -> Result<usize> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        let excess = count - max_events as i64;
        if excess <= 0 {
            return Ok(0);
        }

        let evicted = conn.execute(
            "DELETE FROM events WHERE id IN (SELECT id FROM events ORDER BY id ASC LIMIT ?1)",
            params![excess],
        )?;
        Ok(evicted)
    }

    fn row_to_event(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
        let id = EventId(row.get(0)?);
        let body: String = row.get(1)?;

        // An undecodable body reads as an empty record; the assembler discards
        // and purges those instead of wedging the queue head.
        let record = match EventRecord::from_json(&body) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Stored event body is unreadable");
                EventRecord::default()
            }
        };

        Ok(StoredEvent { id, record })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> EventStore {
        let store = EventStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    fn event(kind: &str, ts: i64) -> EventRecord {
        EventRecord::from_value(json!({"type": kind, "ts": ts, "url": "https://example.com"}))
            .unwrap()
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let store = test_store();

        let a = store.append(&event("page_open", 1)).unwrap();
        let b = store.append(&event("click", 2)).unwrap();
        let c = store.append(&event("click", 2)).unwrap();

        assert!(a < b && b < c);
        // Identical records are not deduplicated
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_ids_never_reused_after_delete() {
        let store = test_store();

        let first = store.append(&event("focus", 1)).unwrap();
        let second = store.append(&event("blur", 2)).unwrap();
        assert!(store.delete_by_ids(&[second]).is_empty());

        let third = store.append(&event("focus", 3)).unwrap();
        assert!(third > second);
        assert!(first < third);
    }

    #[test]
    fn test_read_oldest_is_ordered_and_side_effect_free() {
        let store = test_store();
        for ts in 0..5 {
            store.append(&event("scroll", ts)).unwrap();
        }

        let oldest = store.read_oldest(3).unwrap();
        assert_eq!(oldest.len(), 3);
        assert!(oldest.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(oldest[0].record.ts(), Some(0));

        // Reading again yields the same rows
        let again = store.read_oldest(3).unwrap();
        assert_eq!(oldest, again);
        assert_eq!(store.count().unwrap(), 5);

        assert_eq!(store.read_oldest(50).unwrap().len(), 5);
    }

    #[test]
    fn test_delete_by_ids_removes_exactly_given_ids() {
        let store = test_store();
        let ids: Vec<EventId> = (0..4)
            .map(|ts| store.append(&event("keydown", ts)).unwrap())
            .collect();

        let failed = store.delete_by_ids(&[ids[0], ids[2]]);
        assert!(failed.is_empty());

        let remaining: Vec<EventId> = store.read_all().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![ids[1], ids[3]]);

        // Unknown ids are not failures
        assert!(store.delete_by_ids(&[EventId(999)]).is_empty());
    }

    /// Make deletes of one row fail, as a locked or corrupt page would.
    fn pin_row(store: &EventStore, id: EventId) {
        store
            .connection()
            .unwrap()
            .execute_batch(&format!(
                "CREATE TRIGGER pin_row BEFORE DELETE ON events WHEN old.id = {}
                 BEGIN SELECT RAISE(ABORT, 'row is pinned'); END;",
                id.0
            ))
            .unwrap();
    }

    #[test]
    fn test_delete_by_ids_reports_failed_ids_and_removes_the_rest() {
        let store = test_store();
        let ids: Vec<EventId> = (0..3)
            .map(|ts| store.append(&event("click", ts)).unwrap())
            .collect();
        pin_row(&store, ids[1]);

        let failed = store.delete_by_ids(&ids);
        assert_eq!(failed, vec![ids[1]]);

        let remaining: Vec<EventId> = store.read_all().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![ids[1]]);
    }

    #[test]
    fn test_append_succeeds_when_eviction_fails() {
        let store = test_store().with_max_events(1);
        let first = store.append(&event("click", 0)).unwrap();
        pin_row(&store, first);

        // The insert landed; only the eviction was refused
        let second = store.append(&event("click", 1)).unwrap();
        assert!(second > first);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_prune_evicts_oldest_first() {
        let store = test_store().with_max_events(3);
        let ids: Vec<EventId> = (0..5)
            .map(|ts| store.append(&event("click", ts)).unwrap())
            .collect();

        let remaining: Vec<EventId> = store.read_all().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(remaining, ids[2..].to_vec());

        assert_eq!(store.prune_to(1).unwrap(), 2);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.prune_to(10).unwrap(), 0);
    }

    #[test]
    fn test_unreadable_body_reads_as_empty_record() {
        let store = test_store();
        {
            let conn = store.connection().unwrap();
            conn.execute(
                "INSERT INTO events (event_type, ts, received_ts, body) VALUES ('x', 0, 0, 'not json')",
                [],
            )
            .unwrap();
        }

        let events = store.read_all().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].record.is_empty());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/events.db");

        let store = EventStore::open(&path, &StoreConfig::default()).unwrap();
        store.migrate().unwrap();
        store.append(&event("page_open", 1)).unwrap();
        drop(store);

        let reopened = EventStore::open(&path, &StoreConfig::default()).unwrap();
        reopened.migrate().unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
