//! HTTP client for the collector's batch endpoint
//!
//! The request path is the fallback transport: one POST per batch, with the
//! serialized batch as the JSON body. Any 2xx status means the collector has
//! taken the batch.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};

use crate::config::CollectorConfig;
use crate::error::{Error, Result, TransportError};

/// One-shot request transport for serialized batches.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn post_batch(&self, body: &str) -> std::result::Result<(), TransportError>;
}

/// HTTP client for the collector
pub struct CollectorClient {
    http_client: reqwest::Client,
    url: String,
}

impl CollectorClient {
    /// Create a new collector client from configuration
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        reqwest::Url::parse(&config.http_url)
            .map_err(|e| Error::Config(format!("invalid collector.http_url: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.agent_name)
                .map_err(|e| Error::Config(format!("invalid collector.agent_name: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: config.http_url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST one serialized batch.
    pub async fn send_batch(&self, body: &str) -> std::result::Result<(), TransportError> {
        let response = self
            .http_client
            .post(&self.url)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout("HTTP request")
                } else {
                    TransportError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            tracing::debug!(status = status.as_u16(), body = %error_text, "Collector rejected batch");
            Err(TransportError::Http {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl RequestTransport for CollectorClient {
    async fn post_batch(&self, body: &str) -> std::result::Result<(), TransportError> {
        self.send_batch(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = CollectorClient::new(&CollectorConfig::default()).unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:5000/events");
    }

    #[test]
    fn test_client_rejects_bad_url() {
        let config = CollectorConfig {
            http_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            CollectorClient::new(&config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_request_error() {
        // Bind then drop a listener so the port is closed
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = CollectorConfig {
            http_url: format!("http://127.0.0.1:{}/events", port),
            ..Default::default()
        };
        let client = CollectorClient::new(&config).unwrap();

        let err = client.send_batch("{}").await.unwrap_err();
        assert!(matches!(err, TransportError::Request(_)));
    }
}
