//! Transport abstraction for the realtime channel.
//!
//! A [`Connector`] opens connections; each connection is split into a
//! sending and a receiving half so the session can do both at once.
//! Frames are JSON text.

use async_trait::async_trait;
use driftwood_common::Result;

/// Opens transport connections to the backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TransportConnection>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}

/// Sending half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Receiving half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame, or `None` once the connection is closed.
    async fn recv(&mut self) -> Result<Option<String>>;
}

/// An open connection.
pub struct TransportConnection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}
