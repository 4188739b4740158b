//! Transport selection for one batch
//!
//! The live stream is preferred; anything short of a confirmed stream write
//! falls through to the request path within the same attempt.

use std::sync::Arc;

use serde::Serialize;

use super::client::RequestTransport;
use super::connection::ConnectionManager;
use crate::error::TransportError;
use crate::types::Batch;

/// Which transport carried a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stream,
    Request,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stream => "stream",
            TransportKind::Request => "request",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(TransportKind),
    Failed(TransportError),
}

/// Sends batches over the stream when connected, otherwise by request.
pub struct Delivery {
    connection: Option<ConnectionManager>,
    request: Arc<dyn RequestTransport>,
}

impl Delivery {
    pub fn new(connection: Option<ConnectionManager>, request: Arc<dyn RequestTransport>) -> Self {
        Self {
            connection,
            request,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionManager> {
        self.connection.as_ref()
    }

    /// Deliver one batch. Never retries across cycles and never touches the
    /// store.
    pub async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
        let body = match batch.to_json() {
            Ok(body) => body,
            Err(e) => return DeliveryOutcome::Failed(TransportError::Encode(e.to_string())),
        };

        if let Some(connection) = &self.connection {
            match connection.send(&body).await {
                Ok(()) => return DeliveryOutcome::Delivered(TransportKind::Stream),
                Err(TransportError::StreamUnavailable) => {}
                Err(e) => {
                    tracing::warn!(
                        batch_id = batch.batch_id(),
                        error = %e,
                        "Stream send failed, falling back to HTTP"
                    );
                }
            }
        }

        match self.request.post_batch(&body).await {
            Ok(()) => DeliveryOutcome::Delivered(TransportKind::Request),
            Err(e) => DeliveryOutcome::Failed(e),
        }
    }
}
