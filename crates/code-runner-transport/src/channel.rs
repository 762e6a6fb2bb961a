//! Transport channel abstraction.
//!
//! A channel is a bidirectional pipe of text frames to one endpoint. The
//! driver side (a socket task, or a loopback peer) pushes events in arrival
//! order; the owner side reads them one at a time, so there is exactly one
//! consumer and no reordering.

use std::sync::Arc;

use async_trait::async_trait;
use code_runner_core::{ChannelState, SessionError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Event delivered by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connection is established.
    Opened,
    /// A raw text frame arrived.
    Message(String),
    /// The remote side closed the connection.
    Closed { reason: Option<String> },
    /// The connection failed.
    Errored(String),
}

/// Channel error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    ChannelClosed,
}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::ChannelClosed => Self::ChannelClosed,
        }
    }
}

/// Bidirectional message channel to a single endpoint.
#[async_trait]
pub trait Channel: Send {
    /// Current lifecycle state.
    fn state(&self) -> ChannelState;

    /// Subscribe to lifecycle changes.
    fn subscribe_state(&self) -> watch::Receiver<ChannelState>;

    /// Queue a frame for sending.
    ///
    /// # Errors
    /// Returns `ChannelClosed` unless the channel is open.
    fn send(&self, frame: String) -> Result<(), ChannelError>;

    /// Next event in arrival order, or `None` once the channel is closed.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Close the channel. Idempotent; no event is delivered afterwards.
    fn close(&mut self);
}

/// Owner half shared by the channel implementations.
pub(crate) struct ChannelCore {
    state_tx: Arc<watch::Sender<ChannelState>>,
    inbound_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound_tx: Option<mpsc::UnboundedSender<String>>,
    closed: bool,
}

/// Driver half: whatever actually talks to the endpoint.
pub(crate) struct DriverLink {
    state_tx: Arc<watch::Sender<ChannelState>>,
    inbound_tx: mpsc::UnboundedSender<ChannelEvent>,
    pub(crate) outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelCore {
    /// Create a connecting channel and the link its driver uses.
    pub(crate) fn new() -> (Self, DriverLink) {
        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let core = Self {
            state_tx: Arc::clone(&state_tx),
            inbound_rx,
            outbound_tx: Some(outbound_tx),
            closed: false,
        };
        let link = DriverLink {
            state_tx,
            inbound_tx,
            outbound_rx,
        };
        (core, link)
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn send(&self, frame: String) -> Result<(), ChannelError> {
        if !self.state().is_open() {
            return Err(ChannelError::ChannelClosed);
        }
        let tx = self.outbound_tx.as_ref().ok_or(ChannelError::ChannelClosed)?;
        tracing::debug!(bytes = frame.len(), "Sending frame");
        tx.send(frame).map_err(|_| ChannelError::ChannelClosed)
    }

    pub(crate) async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        self.inbound_rx.recv().await
    }

    /// Returns false if the channel was already closed by its owner.
    pub(crate) fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        // Dropping the sender tells the driver to shut the connection down.
        self.outbound_tx = None;
        self.inbound_rx.close();
        // A driver that already closed or failed keeps its state.
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ChannelState::Closed;
                true
            }
        });
        tracing::debug!("Channel closed by owner");
        true
    }
}

impl DriverLink {
    pub(crate) fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Move to `next` unless the channel already reached a terminal state.
    fn transition(&self, next: ChannelState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    /// Connection established.
    pub(crate) fn opened(&self) -> bool {
        let changed = self.transition(ChannelState::Open);
        if changed {
            let _ = self.inbound_tx.send(ChannelEvent::Opened);
        }
        changed
    }

    /// Deliver a raw frame.
    pub(crate) fn deliver(&self, frame: String) {
        if self.state().is_open() {
            let _ = self.inbound_tx.send(ChannelEvent::Message(frame));
        }
    }

    /// Remote side closed.
    pub(crate) fn closed(&self, reason: Option<String>) {
        if self.transition(ChannelState::Closed) {
            let _ = self.inbound_tx.send(ChannelEvent::Closed { reason });
        }
    }

    /// Connection failed.
    pub(crate) fn failed(&self, error: String) {
        if self.transition(ChannelState::Errored) {
            let _ = self.inbound_tx.send(ChannelEvent::Errored(error));
        }
    }
}
