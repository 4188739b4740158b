//! Error types for activity-relay-core

use thiserror::Error;

/// Main error type for the activity-relay-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or empty event handed in by a producer
    #[error("rejected event: {0}")]
    Producer(String),

    /// Store-level failure that is not a plain SQLite error (timeouts, worker panics)
    #[error("storage error: {0}")]
    Storage(String),

    /// Delivery failure on either transport
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Stream handshake or link failure
    #[error("connection error: {0}")]
    Connection(String),
}

/// Why a single delivery attempt did not reach the collector.
///
/// Every variant is recoverable: the events stay in the store and the next
/// cycle tries again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The live stream refused or dropped the frame
    #[error("stream send failed: {0}")]
    StreamSend(String),

    /// No live stream to send on
    #[error("stream not connected")]
    StreamUnavailable,

    /// Collector answered with a non-2xx status
    #[error("HTTP POST failed with status {status}")]
    Http { status: u16 },

    /// Request never produced a response (DNS, refused, reset)
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// The attempt exceeded its time budget
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Payload could not be serialized
    #[error("failed to encode batch: {0}")]
    Encode(String),
}

/// Result type alias for activity-relay-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_messages() {
        assert_eq!(
            TransportError::Http { status: 500 }.to_string(),
            "HTTP POST failed with status 500"
        );
        assert_eq!(
            TransportError::Timeout("stream send").to_string(),
            "stream send timed out"
        );

        let err: Error = TransportError::StreamUnavailable.into();
        assert_eq!(err.to_string(), "transport error: stream not connected");
    }
}
