//! WebSocket transport using tokio-tungstenite.

use async_trait::async_trait;
use driftwood_common::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::transport::{Connector, FrameSink, FrameStream, TransportConnection};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a `ws://` or `wss://` endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    /// # Errors
    /// - `url` does not parse or is not a WebSocket URL
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid channel URL {}: {}", url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "Channel URL must use ws:// or wss://, got {}",
                url
            )));
        }
        Ok(Self { url })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<TransportConnection> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("Failed to connect to {}: {}", self.url, e)))?;
        debug!("WebSocket connected to {}", self.url);

        let (sink, stream) = ws.split();
        Ok(TransportConnection {
            sink: Box::new(WsSink { sink }),
            stream: Box::new(WsFrames { stream }),
        })
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| Error::Transport(format!("Send failed: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| Error::Transport(format!("Close failed: {}", e)))
    }
}

struct WsFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8(bytes.to_vec())
                        .map_err(|e| Error::Transport(format!("Non UTF-8 binary frame: {}", e)))?;
                    return Ok(Some(text));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Protocol-level ping/pong is answered by tungstenite.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::Transport(format!("Receive failed: {}", e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_websocket_urls() {
        assert!(matches!(
            WebSocketConnector::new("http://example.com/socket"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            WebSocketConnector::new("::"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_endpoint() {
        let connector = WebSocketConnector::new("wss://example.com/live").unwrap();
        assert_eq!(connector.endpoint(), "wss://example.com/live");
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:9/").unwrap();
        let result = connector.connect().await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
