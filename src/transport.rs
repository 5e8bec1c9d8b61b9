//! Transport Module
//!
//! Bidirectional text-frame channel to the pubsub endpoint. The session only
//! talks to the [`Connector`] and [`Connection`] traits; [`WsConnector`] is the
//! WebSocket implementation used in production.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Errors that can occur on the transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout after {0}ms")]
    Timeout(u64),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Connection closed")]
    Closed,
}

/// One inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Ping or pong; only proves liveness
    Control,
}

/// An open connection
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a keep-alive ping
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the peer has closed the connection
    ///
    /// Must be cancel safe: it is polled inside `select!`.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens connections to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// WebSocket connector over tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, TransportError> {
        info!("Connecting to {}", endpoint);

        let (stream, response) = timeout(self.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!("WebSocket handshake completed with status {}", response.status());
        Ok(Box::new(WsConnection { stream }))
    }
}

/// An open WebSocket
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            };
            return match message {
                Message::Text(text) => Some(Ok(Frame::Text(text))),
                Message::Binary(bytes) => Some(Ok(Frame::Binary(bytes))),
                Message::Ping(_) | Message::Pong(_) => Some(Ok(Frame::Control)),
                Message::Close(frame) => {
                    debug!("Peer closed connection: {:?}", frame);
                    None
                }
                Message::Frame(_) => continue,
            };
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== TransportError tests ====================

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Timeout(5000);
        assert!(err.to_string().contains("5000"));

        let err = TransportError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        assert_eq!(TransportError::Closed.to_string(), "Connection closed");
    }

    // ==================== WsConnector tests ====================

    #[tokio::test]
    async fn test_connect_refused_endpoint() {
        let connector = WsConnector::new(Duration::from_secs(2));
        let result = connector.connect("ws://127.0.0.1:1").await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed(_)) | Err(TransportError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_invalid_url() {
        let connector = WsConnector::new(Duration::from_secs(2));
        let result = connector.connect("not a url").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
