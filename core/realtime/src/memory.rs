//! In-process transport for tests and local development.
//!
//! The connector doubles as the server side: it records every frame the
//! client sends, can push frames to the client, drop the connection, or
//! refuse new connections.

use async_trait::async_trait;
use driftwood_common::{Error, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::{Envelope, Frame};
use crate::transport::{Connector, FrameSink, FrameStream, TransportConnection};

struct Server {
    next_connection: u64,
    current: Option<(u64, mpsc::UnboundedSender<String>)>,
    connects: u32,
    refuse: bool,
    refuse_next: u32,
    auto_pong: bool,
    sent: Vec<Frame>,
}

impl Server {
    fn is_current(&self, connection: u64) -> bool {
        self.current.as_ref().is_some_and(|(id, _)| *id == connection)
    }
}

/// Connector backed by in-memory channels. Clones share the same server.
#[derive(Clone)]
pub struct MemoryConnector {
    server: Arc<Mutex<Server>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// A server that accepts connections and answers pings.
    pub fn new() -> Self {
        Self {
            server: Arc::new(Mutex::new(Server {
                next_connection: 0,
                current: None,
                connects: 0,
                refuse: false,
                refuse_next: 0,
                auto_pong: true,
                sent: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Server> {
        self.server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse every connection attempt while set.
    pub fn set_refuse(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.lock().refuse_next = count;
    }

    /// Whether client pings are answered.
    pub fn set_auto_pong(&self, auto_pong: bool) {
        self.lock().auto_pong = auto_pong;
    }

    /// Successful connections so far.
    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Frames received from the client, oldest first.
    pub fn sent(&self) -> Vec<Frame> {
        self.lock().sent.clone()
    }

    /// Push a frame to the connected client. Returns false when nobody is
    /// connected.
    pub fn push(&self, frame: &Frame) -> bool {
        let Ok(text) = frame.encode() else {
            return false;
        };
        self.push_raw(text)
    }

    /// Push raw text, which need not be a valid frame.
    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        match &self.lock().current {
            Some((_, tx)) => tx.send(text.into()).is_ok(),
            None => false,
        }
    }

    /// Publish a message on `topic`.
    pub fn publish(&self, topic: &str, payload: Value) -> bool {
        self.push(&Frame::Message(Envelope::new(topic, payload)))
    }

    /// Close the current connection from the server side.
    pub fn drop_connection(&self) {
        if let Some((id, _)) = self.lock().current.take() {
            debug!("Memory server dropped connection {}", id);
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<TransportConnection> {
        let mut server = self.lock();
        if server.refuse {
            return Err(Error::Transport("Connection refused".to_string()));
        }
        if server.refuse_next > 0 {
            server.refuse_next -= 1;
            return Err(Error::Transport("Connection refused".to_string()));
        }

        let id = server.next_connection;
        server.next_connection += 1;
        server.connects += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        server.current = Some((id, tx));

        Ok(TransportConnection {
            sink: Box::new(MemorySink {
                server: self.clone(),
                connection: id,
            }),
            stream: Box::new(MemoryStream { rx }),
        })
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}

struct MemorySink {
    server: MemoryConnector,
    connection: u64,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<()> {
        let mut server = self.server.lock();
        if !server.is_current(self.connection) {
            return Err(Error::Transport("Connection closed".to_string()));
        }

        let frame = Frame::decode(&frame)?;
        if let (Frame::Ping { id }, true) = (&frame, server.auto_pong) {
            if let Some((_, tx)) = &server.current {
                if let Ok(pong) = (Frame::Pong { id: *id }).encode() {
                    let _ = tx.send(pong);
                }
            }
        }
        server.sent.push(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut server = self.server.lock();
        if server.is_current(self.connection) {
            server.current = None;
        }
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.unwrap();
        assert!(connector.is_connected());

        conn.sink
            .send(Frame::Ping { id: 1 }.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(connector.sent(), vec![Frame::Ping { id: 1 }]);

        // Auto pong.
        let reply = conn.stream.recv().await.unwrap().unwrap();
        assert_eq!(Frame::decode(&reply).unwrap(), Frame::Pong { id: 1 });

        assert!(connector.publish("t", json!(1)));
        let text = conn.stream.recv().await.unwrap().unwrap();
        assert!(matches!(Frame::decode(&text).unwrap(), Frame::Message(_)));
    }

    #[tokio::test]
    async fn test_drop_connection_ends_stream() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.unwrap();

        connector.drop_connection();
        assert!(conn.stream.recv().await.unwrap().is_none());
        assert!(conn.sink.send("{}".to_string()).await.is_err());
        assert!(!connector.publish("t", json!(1)));
    }

    #[tokio::test]
    async fn test_refusal() {
        let connector = MemoryConnector::new();
        connector.refuse_next(2);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());

        connector.set_refuse(true);
        assert!(connector.connect().await.is_err());
        assert_eq!(connector.connects(), 1);
    }
}
