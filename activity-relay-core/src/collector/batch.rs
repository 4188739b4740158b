//! Batch assembly
//!
//! Turns the oldest stored events into a delivery payload.

use crate::error::Result;
use crate::store::EventStore;
use crate::types::{Batch, ClientInfo, EventId};

/// Outcome of one assembly pass
#[derive(Debug)]
pub enum Assembly {
    /// Nothing to send. `discarded` lists rows that were read but were empty
    /// after stripping; they carry no data and should be purged.
    Empty { discarded: Vec<EventId> },
    /// A batch ready for delivery
    Ready(Batch),
}

impl Assembly {
    pub fn is_empty(&self) -> bool {
        matches!(self, Assembly::Empty { .. })
    }
}

/// Builds batches from the head of the event store
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    client: ClientInfo,
}

impl BatchAssembler {
    pub fn new(client: ClientInfo) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    /// Read up to `max_events` oldest events and package them.
    ///
    /// Internal keys are stripped and records left empty are dropped from the
    /// payload. Every id read (dropped ones included) is a batch member, so a
    /// successful delivery retires them all.
    pub fn assemble(&self, store: &EventStore, max_events: usize) -> Result<Assembly> {
        let stored = store.read_oldest(max_events)?;

        let mut member_ids = Vec::with_capacity(stored.len());
        let mut events = Vec::with_capacity(stored.len());
        let mut discarded = Vec::new();

        for event in stored {
            member_ids.push(event.id);
            let record = event.record.without_internal_keys();
            if record.is_empty() {
                discarded.push(event.id);
            } else {
                events.push(record);
            }
        }

        if events.is_empty() {
            return Ok(Assembly::Empty { discarded });
        }

        if !discarded.is_empty() {
            tracing::debug!(count = discarded.len(), "Dropped empty records from batch");
        }

        Ok(Assembly::Ready(Batch::new(
            self.client.clone(),
            events,
            member_ids,
        )))
    }
}
