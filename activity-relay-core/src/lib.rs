//! # activity-relay-core
//!
//! Core library for activity-relay, a local agent that accepts activity
//! events from producers and delivers them to a remote collector.
//!
//! This library provides:
//! - A durable SQLite event queue
//! - Batch assembly and per-batch retry bookkeeping
//! - A WebSocket stream transport with reconnect backoff, and an HTTP fallback
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Delivery guarantee
//!
//! At-least-once. An event leaves the store only after a transport has
//! confirmed the batch containing it. Every event carries an `event_id` so
//! the collector can drop duplicates.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use activity_relay_core::{Agent, Config, EventStore};
//!
//! # async fn run() -> activity_relay_core::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(EventStore::open(&config.store_path(), &config.store)?);
//! store.migrate()?;
//!
//! let agent = Agent::new(config, store)?;
//! agent.start().await?;
//! agent.submit(serde_json::json!({"type": "page_open", "url": "https://example.com"}));
//! agent.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use agent::{Agent, AgentBuilder};
pub use config::Config;
pub use error::{Error, Result, TransportError};
pub use stats::ActivityStats;
pub use store::EventStore;
pub use types::*;

// Public modules
pub mod agent;
pub mod collector;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod intake;
pub mod logging;
pub mod stats;
pub mod store;
pub mod types;
