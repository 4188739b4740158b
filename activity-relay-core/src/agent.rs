//! The running relay: store, delivery loop, stream connection, and the
//! control operations exposed to producers and operators.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::collector::{
    BatchAssembler, CollectorClient, ConnectionManager, ConnectionSnapshot, CycleReport, Delivery,
    DeliveryPipeline, DeliveryScheduler, RequestTransport, RetryTracker, StreamConnector,
    WsConnector,
};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ReachabilityProbe, TcpProbe};
use crate::error::Result;
use crate::intake;
use crate::stats::ActivityStats;
use crate::store::EventStore;
use crate::types::{BatchFingerprint, ClientInfo, EventId, StoredEvent};

/// Assembles an [`Agent`], with optional transport overrides for tests.
pub struct AgentBuilder {
    config: Config,
    store: Arc<EventStore>,
    request: Option<Arc<dyn RequestTransport>>,
    connector: Option<Arc<dyn StreamConnector>>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
}

impl AgentBuilder {
    pub fn request_transport(mut self, transport: Arc<dyn RequestTransport>) -> Self {
        self.request = Some(transport);
        self
    }

    pub fn stream_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let config = self.config;

        let request: Arc<dyn RequestTransport> = match self.request {
            Some(request) => request,
            None => Arc::new(CollectorClient::new(&config.collector)?),
        };

        let (connection, monitor) = if config.collector.stream_enabled {
            let connector: Arc<dyn StreamConnector> = match self.connector {
                Some(connector) => connector,
                None => Arc::new(WsConnector::new(config.collector.stream_url.clone())),
            };
            let probe: Arc<dyn ReachabilityProbe> = match self.probe {
                Some(probe) => probe,
                None => Arc::new(TcpProbe::for_url(
                    &config.collector.stream_url,
                    config.connectivity.probe_timeout(),
                )?),
            };

            let connection = ConnectionManager::new(
                connector,
                &config.connection,
                config.collector.send_timeout(),
            );
            let monitor = Arc::new(ConnectivityMonitor::new(
                probe,
                config.connectivity.poll_interval(),
            ));
            (Some(connection), Some(monitor))
        } else {
            (None, None)
        };

        let pipeline = Arc::new(DeliveryPipeline::new(
            Arc::clone(&self.store),
            BatchAssembler::new(ClientInfo::new(config.collector.agent_name.clone())),
            Delivery::new(connection.clone(), request),
            RetryTracker::new(config.delivery.retry_limit),
            config.delivery.batch_size,
            config.store.operation_timeout(),
        ));

        let (shutdown, _) = watch::channel(false);

        Ok(Agent {
            config,
            store: self.store,
            pipeline,
            connection,
            monitor,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// A configured relay instance
pub struct Agent {
    config: Config,
    store: Arc<EventStore>,
    pipeline: Arc<DeliveryPipeline>,
    connection: Option<ConnectionManager>,
    monitor: Option<Arc<ConnectivityMonitor>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn builder(config: Config, store: Arc<EventStore>) -> AgentBuilder {
        AgentBuilder {
            config,
            store,
            request: None,
            connector: None,
            probe: None,
        }
    }

    /// Build an agent with the real HTTP, WebSocket, and TCP-probe backends.
    pub fn new(config: Config, store: Arc<EventStore>) -> Result<Self> {
        Self::builder(config, store).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    // ============================================
    // Producer boundary
    // ============================================

    /// Accept one event from a producer. Failures are logged, never raised.
    pub fn submit(&self, value: Value) -> Option<EventId> {
        match self.try_submit(value) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Dropped submitted event");
                None
            }
        }
    }

    /// Like [`Agent::submit`], but reports why an event was not stored.
    pub fn try_submit(&self, value: Value) -> Result<EventId> {
        let record = intake::prepare(value)?;
        self.store.append(&record)
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Spawn the delivery timer and connectivity monitor and open the stream.
    pub async fn start(&self) -> Result<()> {
        // The bound may have shrunk since the store was last written
        let evicted = self.store.prune_to(self.config.store.max_events)?;
        if evicted > 0 {
            warn!(
                evicted,
                max_events = self.config.store.max_events,
                "Event store over capacity at startup, evicted oldest events"
            );
        }

        let pending = self.store.count()?;
        info!(pending, "Starting relay");

        let mut tasks = Vec::new();

        if let (Some(connection), Some(monitor)) = (&self.connection, &self.monitor) {
            if monitor.prime().await {
                connection.connect();
            } else {
                warn!("Collector unreachable at startup, waiting for connectivity");
                connection.network_lost();
            }
            tasks.push(
                Arc::clone(monitor).spawn(connection.clone(), self.shutdown.subscribe()),
            );
        }

        tasks.push(
            DeliveryScheduler::new(
                Arc::clone(&self.pipeline),
                self.connection.clone(),
                self.config.delivery.flush_interval(),
            )
            .spawn(self.shutdown.subscribe()),
        );

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        Ok(())
    }

    /// Stop background loops, close the stream, and make one final
    /// best-effort delivery over the request path.
    pub async fn shutdown(&self) -> Result<CycleReport> {
        info!("Shutting down relay");
        let _ = self.shutdown.send(true);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(connection) = &self.connection {
            connection.close();
        }

        let report = self.pipeline.run_cycle().await;
        if let Ok(pending) = self.store.count() {
            info!(pending, "Relay stopped");
        }
        report
    }

    // ============================================
    // Control surface
    // ============================================

    /// Run one delivery cycle now, after any in-flight cycle finishes.
    pub async fn flush_now(&self) -> Result<CycleReport> {
        self.pipeline.run_cycle().await
    }

    pub fn export_all(&self) -> Result<Vec<StoredEvent>> {
        self.store.read_all()
    }

    pub fn compute_stats(&self) -> Result<ActivityStats> {
        Ok(ActivityStats::compute(&self.store.read_all()?))
    }

    /// Connection state, or `None` when the stream is disabled.
    pub fn connection(&self) -> Option<ConnectionSnapshot> {
        self.connection.as_ref().map(ConnectionManager::snapshot)
    }

    /// The stream connection driver, when enabled.
    pub fn connection_manager(&self) -> Option<&ConnectionManager> {
        self.connection.as_ref()
    }

    pub fn is_online(&self) -> bool {
        self.monitor.as_ref().map_or(true, |m| m.is_online())
    }

    /// Fingerprints currently carrying failures
    pub fn tracked_failures(&self) -> usize {
        self.pipeline.tracked_failures()
    }

    pub fn retry_attempts(&self, fingerprint: &BatchFingerprint) -> u32 {
        self.pipeline.retry_attempts(fingerprint)
    }
}
