//! One delivery cycle: assemble, deliver, then delete or count the failure.
//!
//! Cycles never overlap. Scheduled ticks skip when a cycle is already in
//! flight; an explicit flush waits its turn. Store calls run on the blocking
//! pool under a timeout so a wedged SQLite lock cannot stall the runtime.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::batch::{Assembly, BatchAssembler};
use super::delivery::{Delivery, DeliveryOutcome, TransportKind};
use super::retry::{RetryTracker, RetryVerdict};
use crate::error::{Error, Result, TransportError};
use crate::store::EventStore;
use crate::types::{BatchFingerprint, EventId};

/// What a single cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    /// Another cycle was in flight
    Skipped,
    /// Nothing deliverable; `purged` empty records were removed
    Idle { purged: usize },
    Delivered {
        batch_id: String,
        events: usize,
        via: TransportKind,
        /// Member ids the store failed to delete; they will be sent again
        undeleted: Vec<EventId>,
    },
    Failed {
        batch_id: String,
        events: usize,
        reason: TransportError,
        verdict: RetryVerdict,
    },
}

impl CycleReport {
    /// False only when a batch was attempted and not delivered.
    pub fn is_success(&self) -> bool {
        !matches!(self, CycleReport::Failed { .. })
    }
}

/// Short form for status output
#[derive(Debug, Serialize)]
pub struct CycleSummary {
    pub outcome: &'static str,
    pub events: usize,
    pub detail: Option<String>,
}

impl From<&CycleReport> for CycleSummary {
    fn from(report: &CycleReport) -> Self {
        match report {
            CycleReport::Skipped => Self {
                outcome: "skipped",
                events: 0,
                detail: None,
            },
            CycleReport::Idle { purged } => Self {
                outcome: "idle",
                events: 0,
                detail: (*purged > 0).then(|| format!("purged {} empty records", purged)),
            },
            CycleReport::Delivered {
                events, via, ..
            } => Self {
                outcome: "delivered",
                events: *events,
                detail: Some(format!("via {}", via)),
            },
            CycleReport::Failed { events, reason, .. } => Self {
                outcome: "failed",
                events: *events,
                detail: Some(reason.to_string()),
            },
        }
    }
}

/// Runs delivery cycles against a shared store
pub struct DeliveryPipeline {
    store: Arc<EventStore>,
    assembler: BatchAssembler,
    delivery: Delivery,
    tracker: Mutex<RetryTracker>,
    cycle: tokio::sync::Mutex<()>,
    batch_size: usize,
    store_timeout: Duration,
}

impl DeliveryPipeline {
    pub fn new(
        store: Arc<EventStore>,
        assembler: BatchAssembler,
        delivery: Delivery,
        tracker: RetryTracker,
        batch_size: usize,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            assembler,
            delivery,
            tracker: Mutex::new(tracker),
            cycle: tokio::sync::Mutex::new(()),
            batch_size: batch_size.max(1),
            store_timeout,
        }
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Number of batch fingerprints with outstanding failures
    pub fn tracked_failures(&self) -> usize {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tracked()
    }

    /// Recorded failures for one batch fingerprint (0 when untracked)
    pub fn retry_attempts(&self, fingerprint: &BatchFingerprint) -> u32 {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempts(fingerprint)
    }

    /// Run a cycle, waiting for any in-flight cycle to finish first.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _guard = self.cycle.lock().await;
        self.cycle_locked().await
    }

    /// Run a cycle unless one is already in flight.
    pub async fn try_run_cycle(&self) -> Result<CycleReport> {
        let Ok(_guard) = self.cycle.try_lock() else {
            debug!("Delivery cycle already in flight, skipping tick");
            return Ok(CycleReport::Skipped);
        };
        self.cycle_locked().await
    }

    async fn cycle_locked(&self) -> Result<CycleReport> {
        let assembler = self.assembler.clone();
        let batch_size = self.batch_size;
        let assembly = self
            .with_store(move |store| assembler.assemble(store, batch_size))
            .await?;

        let batch = match assembly {
            Assembly::Ready(batch) => batch,
            Assembly::Empty { discarded } => {
                let purged = discarded.len();
                if purged > 0 {
                    warn!(count = purged, "Purging empty records from the queue head");
                    let failed = self
                        .with_store(move |store| Ok(store.delete_by_ids(&discarded)))
                        .await?;
                    return Ok(CycleReport::Idle {
                        purged: purged - failed.len(),
                    });
                }
                return Ok(CycleReport::Idle { purged: 0 });
            }
        };

        let fingerprint = batch.fingerprint();
        let batch_id = batch.batch_id().to_string();
        let events = batch.len();

        match self.delivery.deliver(&batch).await {
            DeliveryOutcome::Delivered(via) => {
                let ids = batch.member_ids().to_vec();
                let undeleted = match self
                    .with_store({
                        let ids = ids.clone();
                        move |store| Ok(store.delete_by_ids(&ids))
                    })
                    .await
                {
                    Ok(failed) => failed,
                    Err(e) => {
                        error!(batch_id = %batch_id, error = %e, "Could not delete delivered events");
                        ids
                    }
                };

                if undeleted.is_empty() {
                    self.tracker
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record_success(&fingerprint);
                } else {
                    warn!(
                        batch_id = %batch_id,
                        undeleted = undeleted.len(),
                        "Delivered events could not all be deleted and will be resent"
                    );
                }

                info!(batch_id = %batch_id, events, via = %via, "Batch delivered");
                Ok(CycleReport::Delivered {
                    batch_id,
                    events,
                    via,
                    undeleted,
                })
            }
            DeliveryOutcome::Failed(reason) => {
                let verdict = self
                    .tracker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_failure(&fingerprint);

                match verdict {
                    RetryVerdict::WillRetry { attempt, limit } => warn!(
                        batch_id = %batch_id,
                        fingerprint = %fingerprint,
                        attempt,
                        limit,
                        error = %reason,
                        "Batch delivery failed, will retry"
                    ),
                    RetryVerdict::PermanentlyFailed { attempts } => error!(
                        batch_id = %batch_id,
                        fingerprint = %fingerprint,
                        attempts,
                        error = %reason,
                        "Batch permanently failed after {} attempts",
                        attempts
                    ),
                    RetryVerdict::Untracked => debug!(
                        batch_id = %batch_id,
                        fingerprint = %fingerprint,
                        error = %reason,
                        "Batch delivery failed again after giving up on it"
                    ),
                    RetryVerdict::Cleared => {}
                }

                Ok(CycleReport::Failed {
                    batch_id,
                    events,
                    reason,
                    verdict,
                })
            }
        }
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&EventStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || op(&store));

        match tokio::time::timeout(self.store_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::Storage(format!("store task failed: {}", e))),
            Err(_) => Err(Error::Storage("store operation timed out".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::client::RequestTransport;
    use crate::types::{ClientInfo, EventRecord};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakyTransport {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestTransport for FlakyTransport {
        async fn post_batch(&self, _body: &str) -> std::result::Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(TransportError::Http { status: 503 })
            }
        }
    }

    fn pipeline(healthy: bool, batch_size: usize) -> (DeliveryPipeline, Arc<EventStore>, Arc<FlakyTransport>) {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        store.migrate().unwrap();
        let transport = Arc::new(FlakyTransport {
            healthy: AtomicBool::new(healthy),
            calls: AtomicUsize::new(0),
        });
        let pipeline = DeliveryPipeline::new(
            store.clone(),
            BatchAssembler::new(ClientInfo::new("test")),
            Delivery::new(None, transport.clone()),
            RetryTracker::new(3),
            batch_size,
            Duration::from_secs(5),
        );
        (pipeline, store, transport)
    }

    fn add(store: &EventStore, value: serde_json::Value) -> EventId {
        store.append(&EventRecord::from_value(value).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_idle_when_store_empty() {
        let (pipeline, _store, transport) = pipeline(true, 10);
        assert_eq!(
            pipeline.run_cycle().await.unwrap(),
            CycleReport::Idle { purged: 0 }
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delivery_deletes_members() {
        let (pipeline, store, _transport) = pipeline(true, 2);
        add(&store, json!({"type": "click", "ts": 1}));
        add(&store, json!({"type": "click", "ts": 2}));
        let third = add(&store, json!({"type": "click", "ts": 3}));

        let report = pipeline.run_cycle().await.unwrap();
        assert!(matches!(
            report,
            CycleReport::Delivered { events: 2, via: TransportKind::Request, .. }
        ));

        let left: Vec<EventId> = store.read_all().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(left, vec![third]);
    }

    #[tokio::test]
    async fn test_failures_keep_events_and_count() {
        let (pipeline, store, transport) = pipeline(false, 10);
        add(&store, json!({"type": "focus", "ts": 1}));

        for expected in 1..=2 {
            let report = pipeline.run_cycle().await.unwrap();
            let CycleReport::Failed { verdict, .. } = report else {
                panic!("expected failure");
            };
            assert_eq!(verdict, RetryVerdict::WillRetry { attempt: expected, limit: 3 });
        }
        let CycleReport::Failed { verdict, .. } = pipeline.run_cycle().await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(verdict, RetryVerdict::PermanentlyFailed { attempts: 3 });

        // Events are never dropped on failure
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(pipeline.tracked_failures(), 0);

        // Still attempted, no longer counted
        let CycleReport::Failed { verdict, .. } = pipeline.run_cycle().await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(verdict, RetryVerdict::Untracked);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);

        transport.healthy.store(true, Ordering::SeqCst);
        assert!(pipeline.run_cycle().await.unwrap().is_success());
        assert_eq!(store.count().unwrap(), 0);
    }

    /// Appends a new event while the batch is on the wire.
    struct AppendingTransport {
        store: Arc<EventStore>,
        appended: Mutex<Vec<EventId>>,
    }

    #[async_trait]
    impl RequestTransport for AppendingTransport {
        async fn post_batch(&self, _body: &str) -> std::result::Result<(), TransportError> {
            let id = add(&self.store, json!({"type": "scroll", "ts": 99}));
            self.appended.lock().unwrap().push(id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_appended_mid_cycle_wait_for_next_cycle() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        store.migrate().unwrap();
        add(&store, json!({"type": "click", "ts": 1}));
        add(&store, json!({"type": "click", "ts": 2}));

        let transport = Arc::new(AppendingTransport {
            store: store.clone(),
            appended: Mutex::new(Vec::new()),
        });
        let pipeline = DeliveryPipeline::new(
            store.clone(),
            BatchAssembler::new(ClientInfo::new("test")),
            Delivery::new(None, transport.clone()),
            RetryTracker::new(3),
            10,
            Duration::from_secs(5),
        );

        let report = pipeline.run_cycle().await.unwrap();
        assert!(matches!(report, CycleReport::Delivered { events: 2, .. }));

        let appended = transport.appended.lock().unwrap().clone();
        let left: Vec<EventId> = store.read_all().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(left, appended);
    }

    #[tokio::test]
    async fn test_partial_delete_keeps_retry_record_and_reports_undeleted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        let store = Arc::new(EventStore::open(&path, &crate::config::StoreConfig::default()).unwrap());
        store.migrate().unwrap();

        let transport = Arc::new(FlakyTransport {
            healthy: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        let pipeline = DeliveryPipeline::new(
            store.clone(),
            BatchAssembler::new(ClientInfo::new("test")),
            Delivery::new(None, transport.clone()),
            RetryTracker::new(3),
            10,
            Duration::from_secs(5),
        );

        let kept = add(&store, json!({"type": "click", "ts": 1}));
        let gone = add(&store, json!({"type": "click", "ts": 2}));
        assert!(!pipeline.run_cycle().await.unwrap().is_success());
        assert_eq!(pipeline.tracked_failures(), 1);

        // A second connection refuses to let one row go
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch(&format!(
                "CREATE TRIGGER pin_row BEFORE DELETE ON events WHEN old.id = {}
                 BEGIN SELECT RAISE(ABORT, 'row is pinned'); END;",
                kept.0
            ))
            .unwrap();

        transport.healthy.store(true, Ordering::SeqCst);
        let report = pipeline.run_cycle().await.unwrap();
        let CycleReport::Delivered { events, undeleted, .. } = report else {
            panic!("expected delivery, got {report:?}");
        };
        assert_eq!(events, 2);
        assert_eq!(undeleted, vec![kept]);

        // The failure record survives until every member is gone
        assert_eq!(pipeline.tracked_failures(), 1);
        let left: Vec<EventId> = store.read_all().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(left, vec![kept]);
        assert!(!left.contains(&gone));
    }

    #[tokio::test]
    async fn test_empty_head_is_purged() {
        let (pipeline, store, transport) = pipeline(true, 10);
        add(&store, json!({"_internal": true}));

        assert_eq!(
            pipeline.run_cycle().await.unwrap(),
            CycleReport::Idle { purged: 1 }
        );
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tick_skips_while_cycle_in_flight() {
        let (pipeline, _store, _transport) = pipeline(true, 10);
        let _held = pipeline.cycle.lock().await;
        assert_eq!(pipeline.try_run_cycle().await.unwrap(), CycleReport::Skipped);
    }
}
