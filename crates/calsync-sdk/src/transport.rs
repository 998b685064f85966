//! Connection transport
//!
//! The manager talks to the server through the [`Transport`] trait. Each
//! successful `open` hands the transport a fresh event sink; everything the
//! connection produces (frames, close, errors) is pushed there until the
//! connection ends.

use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{CalsyncError, Result};
use crate::protocol::RealtimeEvent;

/// Something the open connection produced
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(RealtimeEvent),
    /// The connection ended; no further events follow
    Closed { reason: String },
    /// Non-fatal problem, e.g. an undecodable frame
    Error(CalsyncError),
}

pub type TransportSink = mpsc::UnboundedSender<TransportEvent>;

/// Everything needed to open a connection
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub url: String,
    pub auth_token: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
}

/// Duplex channel to the realtime server
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Open a connection. Returns once the connection is usable.
    async fn open(&self, params: &ConnectParams, events: TransportSink) -> Result<()>;

    async fn send(&self, event: &RealtimeEvent) -> Result<()>;

    /// Close the current connection, if any. Never fails.
    async fn close(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over tokio-tungstenite
#[derive(Default)]
pub struct WebSocketTransport {
    writer: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("reading", &self.reader.lock().is_some())
            .finish()
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_request(
        params: &ConnectParams,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = params.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        if let Some(ref token) = params.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| CalsyncError::Config(format!("invalid auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Ok(value) = HeaderValue::from_str(&params.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        Ok(request)
    }

    async fn read_loop(mut stream: futures::stream::SplitStream<WsStream>, events: TransportSink) {
        let reason = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match RealtimeEvent::from_json(&text) {
                    Ok(event) => {
                        if events.send(TransportEvent::Message(event)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("undecodable frame: {}", e);
                        let _ = events.send(TransportEvent::Error(CalsyncError::InvalidData(e.to_string())));
                    }
                },
                Some(Ok(Message::Binary(bytes))) => match serde_json::from_slice::<RealtimeEvent>(&bytes) {
                    Ok(event) => {
                        if events.send(TransportEvent::Message(event)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("undecodable binary frame: {}", e);
                        let _ = events.send(TransportEvent::Error(e.into()));
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                // websocket-level ping/pong is answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("read error: {}", e),
                None => break "stream ended".to_string(),
            }
        };
        debug!("websocket reader finished: {}", reason);
        let _ = events.send(TransportEvent::Closed { reason });
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, params: &ConnectParams, events: TransportSink) -> Result<()> {
        self.close().await;

        let request = Self::build_request(params)?;
        info!("connecting to {}", params.url);
        let (stream, response) = tokio::time::timeout(params.timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| CalsyncError::Transport(format!("connect timed out after {:?}", params.timeout)))??;
        debug!("websocket handshake status {}", response.status());

        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *self.reader.lock() = Some(tokio::spawn(Self::read_loop(reader, events)));
        info!("✅ websocket connected: {}", params.url);
        Ok(())
    }

    async fn send(&self, event: &RealtimeEvent) -> Result<()> {
        let text = event.to_json()?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(CalsyncError::NotConnected)?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.send(Message::Close(None)).await {
                debug!("close frame not sent: {}", e);
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::MockTransport;
    use super::*;

    fn params(url: &str) -> ConnectParams {
        ConnectParams {
            url: url.to_string(),
            auth_token: Some("secret".to_string()),
            user_agent: crate::version::user_agent(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_request_carries_bearer_token() {
        let request = WebSocketTransport::build_request(&params("wss://rt.example.com/realtime")).unwrap();
        assert_eq!(request.headers().get(AUTHORIZATION).unwrap(), "Bearer secret");
        assert!(request.headers().get(USER_AGENT).is_some());
    }

    #[tokio::test]
    async fn test_websocket_send_requires_connection() {
        let transport = WebSocketTransport::new();
        let err = transport.send(&RealtimeEvent::ping(1)).await.unwrap_err();
        assert_eq!(err, CalsyncError::NotConnected);
    }

    #[tokio::test]
    async fn test_mock_auto_ack_and_drop() {
        let transport = MockTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open(&params("ws://localhost"), tx).await.unwrap();

        let frame = RealtimeEvent::new("project:update", serde_json::json!({ "id": "item-1" }));
        transport.send(&frame).await.unwrap();
        match rx.recv().await.unwrap() {
            TransportEvent::Message(ack) => {
                assert_eq!(ack.event_type, "ack");
                assert_eq!(ack.payload["id"], "item-1");
            }
            other => panic!("unexpected {:?}", other),
        }

        transport.drop_connection("network down");
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed { .. })));
        assert!(rx.recv().await.is_none());
        assert!(transport.send(&frame).await.is_err());
    }
}
