//! Persistent stream transport
//!
//! A live stream is represented by a [`StreamLink`]: a frame channel where
//! every frame carries its own acknowledgement, plus a one-shot signal that
//! fires when the link goes away. The WebSocket implementation drives one
//! socket per link from a single task; tests plug in their own
//! [`StreamConnector`] and drive the [`StreamEndpoint`] side by hand.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, TransportError};

/// Frames buffered between the delivery path and the socket task
const FRAME_BUFFER: usize = 16;

/// Opens stream links to the collector.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Perform the handshake and return a live link.
    async fn connect(&self) -> Result<StreamLink>;
}

/// One serialized batch waiting to be written, with its write acknowledgement.
pub struct OutboundFrame {
    payload: String,
    ack: oneshot::Sender<std::result::Result<(), String>>,
}

impl OutboundFrame {
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Report the write result back to the sender.
    pub fn ack(self, result: std::result::Result<(), String>) {
        let _ = self.ack.send(result);
    }
}

/// Delivery-side half of a live stream.
pub struct StreamLink {
    sender: StreamSender,
    closed: ClosedSignal,
}

impl StreamLink {
    pub fn into_parts(self) -> (StreamSender, ClosedSignal) {
        (self.sender, self.closed)
    }
}

/// Transport-side half of a live stream.
///
/// `recv` yields `None` once every [`StreamSender`] clone is dropped, which is
/// how the link owner asks the transport to close.
pub struct StreamEndpoint {
    frames: mpsc::Receiver<OutboundFrame>,
    closed: Option<oneshot::Sender<Option<String>>>,
}

impl StreamEndpoint {
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.frames.recv().await
    }

    /// Report that the link has ended, optionally with an error reason.
    pub fn close(mut self, reason: Option<String>) {
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(reason);
        }
    }
}

/// Create a connected link/endpoint pair.
pub fn link_pair() -> (StreamLink, StreamEndpoint) {
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
    let (closed_tx, closed_rx) = oneshot::channel();

    let link = StreamLink {
        sender: StreamSender { frames: frame_tx },
        closed: ClosedSignal { rx: closed_rx },
    };
    let endpoint = StreamEndpoint {
        frames: frame_rx,
        closed: Some(closed_tx),
    };
    (link, endpoint)
}

/// Cloneable handle for writing frames onto a live link.
#[derive(Clone)]
pub struct StreamSender {
    frames: mpsc::Sender<OutboundFrame>,
}

impl StreamSender {
    /// Write one payload and wait for the transport to confirm it.
    pub async fn send(
        &self,
        payload: &str,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let frame = OutboundFrame {
            payload: payload.to_string(),
            ack: ack_tx,
        };

        let attempt = async {
            self.frames
                .send(frame)
                .await
                .map_err(|_| TransportError::StreamSend("stream link is closed".to_string()))?;
            ack_rx
                .await
                .map_err(|_| TransportError::StreamSend("stream dropped the frame".to_string()))?
                .map_err(TransportError::StreamSend)
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout("stream send"))?
    }
}

/// Resolves when the transport side ends the link.
pub struct ClosedSignal {
    rx: oneshot::Receiver<Option<String>>,
}

impl ClosedSignal {
    /// Wait for the link to end. Returns the error reason, if any.
    pub async fn wait(self) -> Option<String> {
        match self.rx.await {
            Ok(reason) => reason,
            Err(_) => Some("stream transport went away".to_string()),
        }
    }
}

// ============================================
// WebSocket implementation
// ============================================

/// Connects to the collector's WebSocket endpoint.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<StreamLink> {
        info!(url = %self.url, "Connecting to collector stream");

        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("WebSocket handshake failed: {}", e)))?;

        let (link, endpoint) = link_pair();
        tokio::spawn(drive_socket(socket, endpoint));
        Ok(link)
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pump frames to the socket and watch it for closure.
async fn drive_socket(socket: Socket, mut endpoint: StreamEndpoint) {
    let (mut write, mut read) = socket.split();

    let reason = loop {
        tokio::select! {
            frame = endpoint.recv() => match frame {
                Some(frame) => {
                    let text = frame.payload().to_string();
                    match write.send(Message::Text(text.into())).await {
                        Ok(()) => frame.ack(Ok(())),
                        Err(e) => {
                            let reason = e.to_string();
                            frame.ack(Err(reason.clone()));
                            break Some(reason);
                        }
                    }
                }
                None => {
                    // Link owner hung up
                    let _ = write.send(Message::Close(None)).await;
                    break None;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!(message = %text.as_str(), "Message from collector");
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by collector".to_string());
                    break Some(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break Some(e.to_string());
                }
                None => break Some("stream ended".to_string()),
            },
        }
    };

    debug!(reason = ?reason, "Stream link finished");
    endpoint.close(reason);
}
