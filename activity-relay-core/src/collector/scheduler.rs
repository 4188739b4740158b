//! Periodic delivery trigger

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::connection::ConnectionManager;
use super::pipeline::{CycleReport, DeliveryPipeline};

/// Fires a delivery cycle every `period` until shutdown is signalled.
///
/// Each tick also nudges the stream connection, which is a no-op while a
/// link is live, a reconnect is pending, or the network is down.
pub struct DeliveryScheduler {
    pipeline: Arc<DeliveryPipeline>,
    connection: Option<ConnectionManager>,
    period: Duration,
}

impl DeliveryScheduler {
    pub fn new(
        pipeline: Arc<DeliveryPipeline>,
        connection: Option<ConnectionManager>,
        period: Duration,
    ) -> Self {
        Self {
            pipeline,
            connection,
            period,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            info!(period_secs = self.period.as_secs(), "Delivery scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if let Some(connection) = &self.connection {
                    connection.connect();
                }

                match self.pipeline.try_run_cycle().await {
                    Ok(CycleReport::Skipped) => {}
                    Ok(report) => debug!(report = ?report, "Scheduled delivery cycle finished"),
                    Err(e) => error!(error = %e, "Scheduled delivery cycle failed"),
                }
            }

            info!("Delivery scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::batch::BatchAssembler;
    use crate::collector::client::RequestTransport;
    use crate::collector::delivery::Delivery;
    use crate::collector::retry::RetryTracker;
    use crate::error::TransportError;
    use crate::store::EventStore;
    use crate::types::{ClientInfo, EventRecord};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestTransport for CountingTransport {
        async fn post_batch(&self, _body: &str) -> std::result::Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ticks_deliver_and_shutdown_stops() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        store.migrate().unwrap();
        store
            .append(&EventRecord::from_value(json!({"type": "click"})).unwrap())
            .unwrap();

        let transport = Arc::new(CountingTransport::default());
        let pipeline = Arc::new(DeliveryPipeline::new(
            store.clone(),
            BatchAssembler::new(ClientInfo::new("test")),
            Delivery::new(None, transport.clone()),
            RetryTracker::new(3),
            200,
            Duration::from_secs(5),
        ));

        let (tx, rx) = watch::channel(false);
        let handle =
            DeliveryScheduler::new(pipeline, None, Duration::from_millis(50)).spawn(rx);

        let mut waited = Duration::ZERO;
        while store.count().unwrap() > 0 && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
