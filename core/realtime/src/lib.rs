//! Driftwood realtime channel
//!
//! A single logical bidirectional channel to the backend:
//! - Pluggable transports (WebSocket, in-process)
//! - Automatic reconnection with backoff, gated on the connection monitor
//! - Heartbeats with a liveness timeout
//! - Topic routing to subscribed handlers

pub mod channel;
pub mod memory;
pub mod message;
pub mod router;
pub mod transport;
pub mod websocket;

pub use channel::{ChannelConfig, ChannelEvent, ChannelManager, ChannelState};
pub use memory::MemoryConnector;
pub use message::{Envelope, Frame, NotificationHint};
pub use router::TopicRouter;
pub use transport::{Connector, FrameSink, FrameStream, TransportConnection};
pub use websocket::WebSocketConnector;
