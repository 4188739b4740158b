//! Durable event store
//!
//! Append-only local persistence of captured events, backed by SQLite:
//! - Schema migrations
//! - Repository with the append / read-oldest / delete-by-id contract
//! - Oldest-first eviction past a configured retention bound

pub mod repo;
pub mod schema;

pub use repo::EventStore;
