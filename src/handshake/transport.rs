use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{HandshakeError, HandshakeMessage, HandshakeTransport};

/// JSON-over-WebSocket transport for the `/ckm` exchange.
#[derive(Debug)]
pub struct WsHandshakeTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsHandshakeTransport {
    pub async fn connect(url: &str) -> Result<Self, HandshakeError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| HandshakeError::Transport(e.to_string()))?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl HandshakeTransport for WsHandshakeTransport {
    async fn send(&mut self, msg: HandshakeMessage) -> Result<(), HandshakeError> {
        let text = serde_json::to_string(&msg)
            .map_err(|e| HandshakeError::Protocol(format!("encode: {}", e)))?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| HandshakeError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        while let Some(msg) = self.stream.next().await {
            let msg = msg.map_err(|e| HandshakeError::Transport(e.to_string()))?;
            let decoded = match msg {
                Message::Text(text) => serde_json::from_str(&text),
                Message::Binary(bytes) => serde_json::from_slice(&bytes),
                Message::Close(_) => break,
                _ => continue,
            };
            return decoded.map_err(|e| HandshakeError::Protocol(format!("decode: {}", e)));
        }
        Err(HandshakeError::Transport("key exchange connection closed".into()))
    }

    async fn close(&mut self) -> Result<(), HandshakeError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| HandshakeError::Transport(e.to_string()))
    }
}

/// Wrapper that enforces per-message timeouts on recv.
#[derive(Debug)]
pub struct TimeoutTransport<T> {
    inner: T,
    recv_timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, recv_timeout: Duration) -> Self {
        Self {
            inner,
            recv_timeout,
        }
    }
}

#[async_trait]
impl<T> HandshakeTransport for TimeoutTransport<T>
where
    T: HandshakeTransport + Send,
{
    async fn send(&mut self, msg: HandshakeMessage) -> Result<(), HandshakeError> {
        self.inner.send(msg).await
    }

    async fn recv(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        match time::timeout(self.recv_timeout, self.inner.recv()).await {
            Ok(res) => res,
            Err(_) => Err(HandshakeError::Transport("recv timeout".into())),
        }
    }

    async fn close(&mut self) -> Result<(), HandshakeError> {
        self.inner.close().await
    }
}
