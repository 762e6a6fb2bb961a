//! Transport layer for the code runner.
//!
//! Provides:
//! - Wire protocol (JSON frames)
//! - `Channel` trait with an in-memory loopback pair
//! - WebSocket client channel (feature: websocket)
//! - Echo backend router (feature: backend)

pub mod channel;
pub mod loopback;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "backend")]
pub mod backend;

pub use channel::{Channel, ChannelError, ChannelEvent};
pub use loopback::{LoopbackChannel, LoopbackPeer, loopback, loopback_open};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketChannel;
