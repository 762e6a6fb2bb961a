//! In-memory channel pair.
//!
//! [`LoopbackChannel`] behaves like a real channel; [`LoopbackPeer`] plays the
//! backend: it opens and closes the connection, pushes server frames and reads
//! what the client sent.

use async_trait::async_trait;
use code_runner_core::ChannelState;
use tokio::sync::{mpsc::error::TryRecvError, watch};

use crate::{
    channel::{Channel, ChannelCore, ChannelError, ChannelEvent, DriverLink},
    protocol::{self, ClientMessage, ProtocolError, ServerMessage},
};

/// Client side of the loopback pair.
pub struct LoopbackChannel {
    core: ChannelCore,
}

/// Backend side of the loopback pair.
pub struct LoopbackPeer {
    link: DriverLink,
}

/// Create a connecting loopback pair.
#[must_use]
pub fn loopback() -> (LoopbackChannel, LoopbackPeer) {
    let (core, link) = ChannelCore::new();
    (LoopbackChannel { core }, LoopbackPeer { link })
}

/// Create a loopback pair that is already open.
///
/// The `Opened` event is still queued for the client.
#[must_use]
pub fn loopback_open() -> (LoopbackChannel, LoopbackPeer) {
    let (channel, peer) = loopback();
    peer.open();
    (channel, peer)
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn state(&self) -> ChannelState {
        self.core.state()
    }

    fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.core.subscribe_state()
    }

    fn send(&self, frame: String) -> Result<(), ChannelError> {
        self.core.send(frame)
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.core.next_event().await
    }

    fn close(&mut self) {
        self.core.close();
    }
}

impl LoopbackPeer {
    /// Complete the connection.
    pub fn open(&self) {
        self.link.opened();
    }

    /// Current state as seen by the backend.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.link.state()
    }

    /// Push a server message.
    pub fn send(&self, msg: &ServerMessage) {
        self.link.deliver(protocol::encode_server(msg));
    }

    /// Push a raw frame, valid or not.
    pub fn send_raw(&self, frame: impl Into<String>) {
        self.link.deliver(frame.into());
    }

    /// Close the connection from the backend side.
    pub fn close(&self, reason: Option<&str>) {
        self.link.closed(reason.map(str::to_owned));
    }

    /// Fail the connection.
    pub fn fail(&self, error: impl Into<String>) {
        self.link.failed(error.into());
    }

    /// Next raw frame sent by the client, if one is queued.
    pub fn try_recv_frame(&mut self) -> Option<String> {
        match self.link.outbound_rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Next client frame, decoded.
    pub fn try_recv(&mut self) -> Option<Result<ClientMessage, ProtocolError>> {
        self.try_recv_frame().map(|frame| protocol::decode_client(&frame))
    }

    /// Wait for the next raw frame sent by the client.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.link.outbound_rx.recv().await
    }
}
