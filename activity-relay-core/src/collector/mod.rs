//! Delivery to the collector
//!
//! ## Architecture
//!
//! The relay is local-first:
//! - Every accepted event is written to the SQLite store before anything else
//! - A scheduled cycle reads the oldest events, packages them into a batch,
//!   and delivers it
//! - Events are deleted only after the collector has taken the batch
//! - A failed batch stays queued; failures are counted per batch composition
//!
//! Two transports are available. A persistent WebSocket stream is preferred
//! whenever it is connected; otherwise (or if a stream write fails) the batch
//! is POSTed to the collector's HTTP endpoint.
//!
//! ## Configuration
//!
//! ```toml
//! [collector]
//! stream_url = "ws://127.0.0.1:5000/ws"
//! http_url = "http://127.0.0.1:5000/events"
//!
//! [delivery]
//! flush_interval_secs = 15
//! batch_size = 200
//! retry_limit = 3
//! ```

mod batch;
mod client;
mod connection;
mod delivery;
mod pipeline;
mod retry;
mod scheduler;
mod stream;

pub use batch::{Assembly, BatchAssembler};
pub use client::{CollectorClient, RequestTransport};
pub use connection::{
    BackoffPolicy, ConnectionEvent, ConnectionLifecycle, ConnectionManager, ConnectionSnapshot,
    ConnectionState, LifecycleAction,
};
pub use delivery::{Delivery, DeliveryOutcome, TransportKind};
pub use pipeline::{CycleReport, CycleSummary, DeliveryPipeline};
pub use retry::{RetryTracker, RetryVerdict};
pub use scheduler::DeliveryScheduler;
pub use stream::{
    link_pair, ClosedSignal, OutboundFrame, StreamConnector, StreamEndpoint, StreamLink,
    StreamSender, WsConnector,
};
