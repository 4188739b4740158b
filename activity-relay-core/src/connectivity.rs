//! Network reachability monitoring
//!
//! Polls a [`ReachabilityProbe`] and forwards only the edges (online to
//! offline and back) to the stream connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collector::ConnectionManager;
use crate::error::{Error, Result};

/// Answers "can we reach the collector right now?"
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probe that opens (and immediately drops) a TCP connection.
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Probe the host and port of a collector URL.
    pub fn for_url(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid collector URL {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Config(format!("collector URL has no host: {}", url)))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| Error::Config(format!("collector URL has no port: {}", url)))?;
        Ok(Self::new(format!("{}:{}", host, port), timeout))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }
}

/// A change in believed connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    Restored,
    Lost,
}

pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    online: AtomicBool,
    interval: Duration,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, interval: Duration) -> Self {
        Self {
            probe,
            online: AtomicBool::new(true),
            interval,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Take an initial reading without reporting a change.
    pub async fn prime(&self) -> bool {
        let online = self.probe.is_reachable().await;
        self.online.store(online, Ordering::SeqCst);
        online
    }

    /// Probe once and forward an edge to `connection`, if there is one.
    pub async fn poll_once(&self, connection: &ConnectionManager) -> Option<ConnectivityChange> {
        let reachable = self.probe.is_reachable().await;
        let previous = self.online.swap(reachable, Ordering::SeqCst);

        match (previous, reachable) {
            (false, true) => {
                info!("Network connection restored");
                connection.network_restored();
                Some(ConnectivityChange::Restored)
            }
            (true, false) => {
                warn!("Network connection lost");
                connection.network_lost();
                Some(ConnectivityChange::Lost)
            }
            _ => None,
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        connection: ConnectionManager,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

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

                if let Some(change) = self.poll_once(&connection).await {
                    debug!(change = ?change, "Connectivity changed");
                }
            }
        })
    }
}
