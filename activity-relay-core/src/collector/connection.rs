//! Stream connection lifecycle
//!
//! [`ConnectionLifecycle`] is the pure state machine: it decides when to
//! connect, when to back off, and when to give up. [`ConnectionManager`]
//! drives it on the tokio runtime, owning the live link and the pending
//! reconnect timer.
//!
//! Every connect attempt and every scheduled reconnect is tagged with an
//! epoch. Losing the network or restoring it bumps the epoch, so late
//! handshakes, close notifications, and timers from an earlier epoch are
//! ignored instead of resurrecting a link the manager already gave up on.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::stream::{StreamConnector, StreamLink, StreamSender};
use crate::config::ConnectionConfig;
use crate::error::TransportError;

/// Stream connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Exponential reconnect delay with a cap and an attempt budget
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_cap_ms),
            config.max_reconnect_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the reconnect that follows `attempts` earlier ones.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

/// Read-only view of the connection for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub online: bool,
}

/// Side effect requested by a lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    None,
    /// Start a handshake tagged with `epoch`
    Connect { epoch: u64 },
    /// Arm a reconnect timer
    ScheduleReconnect {
        epoch: u64,
        delay: Duration,
        attempt: u32,
    },
    /// Tear down the live link and cancel any pending timer
    Close,
    /// Attempt budget spent; wait for connectivity to come back
    GiveUp { attempts: u32 },
}

/// Pure connection state machine
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    state: ConnectionState,
    reconnect_attempts: u32,
    last_error: Option<String>,
    online: bool,
    reconnect_pending: bool,
    epoch: u64,
    policy: BackoffPolicy,
}

impl ConnectionLifecycle {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
            online: true,
            reconnect_pending: false,
            epoch: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            last_error: self.last_error.clone(),
            online: self.online,
        }
    }

    /// True when `epoch` names the link or attempt currently in flight.
    pub fn owns(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.state != ConnectionState::Disconnected
    }

    /// Connect unless a link exists, an attempt or reconnect is pending,
    /// the network is down, or the attempt budget is spent.
    pub fn request_connect(&mut self) -> LifecycleAction {
        if self.state != ConnectionState::Disconnected
            || self.reconnect_pending
            || !self.online
            || self.reconnect_attempts >= self.policy.max_attempts
        {
            return LifecycleAction::None;
        }
        self.begin_connect()
    }

    fn begin_connect(&mut self) -> LifecycleAction {
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        self.reconnect_pending = false;
        LifecycleAction::Connect { epoch: self.epoch }
    }

    /// Handshake finished. Returns false when the attempt is stale and the
    /// link should be dropped.
    pub fn handshake_succeeded(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.last_error = None;
        true
    }

    /// The link (or the handshake) for `epoch` ended.
    pub fn transport_closed(&mut self, epoch: u64, error: Option<String>) -> LifecycleAction {
        if !self.owns(epoch) {
            return LifecycleAction::None;
        }

        self.state = ConnectionState::Disconnected;
        if error.is_some() {
            self.last_error = error;
        }

        if !self.online {
            return LifecycleAction::None;
        }

        if self.reconnect_attempts >= self.policy.max_attempts {
            return LifecycleAction::GiveUp {
                attempts: self.reconnect_attempts,
            };
        }

        let delay = self.policy.delay_for(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.reconnect_pending = true;
        LifecycleAction::ScheduleReconnect {
            epoch: self.epoch,
            delay,
            attempt: self.reconnect_attempts,
        }
    }

    /// A reconnect timer fired. The attempt was already counted when the
    /// timer was armed, so the budget is not checked again here.
    pub fn reconnect_due(&mut self, epoch: u64) -> LifecycleAction {
        if epoch != self.epoch
            || self.state != ConnectionState::Disconnected
            || !self.reconnect_pending
            || !self.online
        {
            return LifecycleAction::None;
        }
        self.begin_connect()
    }

    /// Connectivity came back: reset the budget and connect right away.
    pub fn network_restored(&mut self) -> LifecycleAction {
        self.online = true;
        if self.state != ConnectionState::Disconnected {
            return LifecycleAction::None;
        }
        self.reconnect_attempts = 0;
        self.begin_connect()
    }

    /// Connectivity went away: drop any link and schedule nothing.
    pub fn network_lost(&mut self) -> LifecycleAction {
        self.online = false;
        self.close()
    }

    /// Stop the stream without touching the connectivity belief.
    pub fn close(&mut self) -> LifecycleAction {
        self.epoch += 1;
        self.reconnect_pending = false;
        let was_live = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        if was_live {
            LifecycleAction::Close
        } else {
            LifecycleAction::None
        }
    }
}

/// Lifecycle notifications, mostly for tests and status displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting { epoch: u64 },
    Connected { epoch: u64 },
    Disconnected { reason: Option<String> },
    ReconnectScheduled { delay: Duration, attempt: u32 },
    GaveUp { attempts: u32 },
    Closed,
}

struct Inner {
    lifecycle: Mutex<ConnectionLifecycle>,
    connector: Arc<dyn StreamConnector>,
    sender: Mutex<Option<StreamSender>>,
    handshake: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    connect_timeout: Duration,
    send_timeout: Duration,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Drives a [`ConnectionLifecycle`] against a [`StreamConnector`].
///
/// Cheap to clone. Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        config: &ConnectionConfig,
        send_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                lifecycle: Mutex::new(ConnectionLifecycle::new(BackoffPolicy::from_config(
                    config,
                ))),
                connector,
                sender: Mutex::new(None),
                handshake: Mutex::new(None),
                reconnect_timer: Mutex::new(None),
                connect_timeout: Duration::from_secs(config.connect_timeout_secs),
                send_timeout,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        lock(&self.inner.lifecycle).snapshot()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.lifecycle).state() == ConnectionState::Connected
    }

    /// Request a connection. No-op when one is live or pending.
    pub fn connect(&self) {
        self.transition(|lc| lc.request_connect());
    }

    pub fn network_restored(&self) {
        self.cancel_reconnect_timer();
        self.transition(|lc| lc.network_restored());
    }

    pub fn network_lost(&self) {
        self.cancel_reconnect_timer();
        self.transition(|lc| lc.network_lost());
    }

    /// Close the stream for shutdown. No reconnect is scheduled.
    pub fn close(&self) {
        self.cancel_reconnect_timer();
        self.transition(|lc| lc.close());
    }

    /// Write one payload on the live link.
    ///
    /// Fails with [`TransportError::StreamUnavailable`] unless connected.
    pub async fn send(&self, payload: &str) -> std::result::Result<(), TransportError> {
        let sender = lock(&self.inner.sender)
            .clone()
            .ok_or(TransportError::StreamUnavailable)?;
        sender.send(payload, self.inner.send_timeout).await
    }

    /// Run one transition and carry out its action.
    ///
    /// On close the live sender is dropped and any handshake in flight is
    /// aborted under the lifecycle lock, so a concurrent handshake can never
    /// install a link into a state that just closed.
    fn transition<F>(&self, f: F)
    where
        F: FnOnce(&mut ConnectionLifecycle) -> LifecycleAction,
    {
        let (action, dropped) = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            let action = f(&mut lifecycle);
            let dropped = match action {
                LifecycleAction::Close => {
                    self.abort_handshake();
                    lock(&self.inner.sender).take()
                }
                _ => None,
            };
            (action, dropped)
        };
        drop(dropped);
        self.apply(action);
    }

    fn apply(&self, action: LifecycleAction) {
        match action {
            LifecycleAction::None => {}
            LifecycleAction::Connect { epoch } => self.spawn_connect(epoch),
            LifecycleAction::ScheduleReconnect {
                epoch,
                delay,
                attempt,
            } => self.spawn_reconnect(epoch, delay, attempt),
            LifecycleAction::Close => {
                info!("Stream connection closed");
                self.emit(ConnectionEvent::Closed);
            }
            LifecycleAction::GiveUp { attempts } => {
                error!(attempts, "Max stream reconnection attempts reached");
                self.emit(ConnectionEvent::GaveUp { attempts });
            }
        }
    }

    fn spawn_connect(&self, epoch: u64) {
        self.emit(ConnectionEvent::Connecting { epoch });
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            let attempt = manager.inner.connector.connect();
            let result = match tokio::time::timeout(manager.inner.connect_timeout, attempt).await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err("stream handshake timed out".to_string()),
            };

            match result {
                Ok(link) => manager.on_link(epoch, link),
                Err(reason) => {
                    warn!(error = %reason, "Stream connection failed");
                    manager.on_closed(epoch, Some(reason));
                }
            }
        });

        // At most one handshake in flight
        if let Some(previous) = lock(&self.inner.handshake).replace(handle) {
            previous.abort();
        }
    }

    fn abort_handshake(&self) {
        if let Some(handshake) = lock(&self.inner.handshake).take() {
            handshake.abort();
        }
    }

    fn on_link(&self, epoch: u64, link: StreamLink) {
        let (sender, closed) = link.into_parts();

        let accepted = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if lifecycle.handshake_succeeded(epoch) {
                *lock(&self.inner.sender) = Some(sender);
                true
            } else {
                false
            }
        };

        if !accepted {
            // Sender dropped here, which asks the transport to close
            debug!(epoch, "Discarding stale stream link");
            return;
        }

        info!("Stream connected");
        self.emit(ConnectionEvent::Connected { epoch });

        let manager = self.clone();
        tokio::spawn(async move {
            let reason = closed.wait().await;
            manager.on_closed(epoch, reason);
        });
    }

    fn on_closed(&self, epoch: u64, reason: Option<String>) {
        let (action, was_current, dropped) = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            let was_current = lifecycle.owns(epoch);
            let action = lifecycle.transport_closed(epoch, reason.clone());
            let dropped = if was_current {
                lock(&self.inner.sender).take()
            } else {
                None
            };
            (action, was_current, dropped)
        };
        drop(dropped);

        if was_current {
            info!(reason = ?reason, "Stream disconnected");
            self.emit(ConnectionEvent::Disconnected { reason });
        }
        self.apply(action);
    }

    fn spawn_reconnect(&self, epoch: u64, delay: Duration, attempt: u32) {
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling stream reconnect"
        );
        self.emit(ConnectionEvent::ReconnectScheduled { delay, attempt });

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.transition(|lc| lc.reconnect_due(epoch));
        });

        if let Some(previous) = lock(&self.inner.reconnect_timer).replace(handle) {
            previous.abort();
        }
    }

    fn cancel_reconnect_timer(&self) {
        if let Some(timer) = lock(&self.inner.reconnect_timer).take() {
            timer.abort();
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }
}
