//! Runner client: one channel, one session.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use code_runner_core::{
    ChannelState, OutputBuffer, RunId, RunRequest, Session, SessionError, SessionEvent,
    SessionSignal, SessionStatus,
};
use code_runner_transport::{
    Channel, ChannelEvent, ProtocolError,
    protocol::{self},
};
use tokio::sync::watch;

use crate::config::ClientConfig;

/// Runner client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Connection did not open within {0:?}")]
    ConnectTimeout(Duration),
    #[error("No message from backend for {0:?}")]
    IdleTimeout(Duration),
    #[error("Channel event stream ended")]
    Disconnected,
}

/// Drives a [`Session`] over a [`Channel`].
///
/// The client owns both and is the only consumer of channel events, all of
/// which go through [`RunnerClient::dispatch`]. Dropping the client drops
/// the channel.
pub struct RunnerClient<C: Channel> {
    channel: C,
    session: Session,
    config: ClientConfig,
    pending: VecDeque<SessionEvent>,
}

#[cfg(feature = "websocket")]
impl RunnerClient<code_runner_transport::WebSocketChannel> {
    /// Start connecting to the configured endpoint.
    ///
    /// Use [`RunnerClient::wait_open`] before the first run.
    #[must_use]
    pub fn connect(config: ClientConfig) -> Self {
        let channel = code_runner_transport::WebSocketChannel::open(config.endpoint.clone());
        Self::with_config(channel, config)
    }
}

impl<C: Channel> RunnerClient<C> {
    /// Create a client over `channel` with the default configuration.
    #[must_use]
    pub fn new(channel: C) -> Self {
        Self::with_config(channel, ClientConfig::default())
    }

    #[must_use]
    pub fn with_config(channel: C, config: ClientConfig) -> Self {
        Self {
            channel,
            session: Session::new(),
            config,
            pending: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.session.status()
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }

    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Shared handle to the output buffer.
    #[must_use]
    pub fn output(&self) -> Arc<OutputBuffer> {
        Arc::clone(self.session.output())
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.session.subscribe_status()
    }

    #[must_use]
    pub fn subscribe_channel(&self) -> watch::Receiver<ChannelState> {
        self.channel.subscribe_state()
    }

    /// Submit a run.
    ///
    /// Rejected without sending anything if a run is in flight, the code is
    /// blank, or the channel is not open.
    ///
    /// # Errors
    /// `InvalidState`, `Validation` or `ChannelClosed`.
    pub fn run(&mut self, request: RunRequest) -> Result<RunId, SessionError> {
        let state = self.channel.state();
        self.session
            .check_run(&request, state)
            .inspect_err(|e| tracing::warn!("Run rejected: {e}"))?;

        let frame = protocol::encode_run(&request)?;
        self.channel.send(frame)?;

        let (run_id, transition) = self.session.start_run(request, state)?;
        self.pending.push_back(SessionEvent::StatusChanged(transition));
        Ok(run_id)
    }

    /// Ask the backend to stop the current run.
    ///
    /// Output already received is kept, and output arriving before the
    /// backend acknowledges is still appended.
    ///
    /// # Errors
    /// `InvalidState` unless running, `ChannelClosed` if the frame cannot be sent.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        self.session
            .check_stop()
            .inspect_err(|e| tracing::warn!("Stop rejected: {e}"))?;

        self.channel.send(protocol::encode_stop())?;

        let transition = self.session.begin_stop()?;
        self.pending.push_back(SessionEvent::StatusChanged(transition));
        Ok(())
    }

    /// Clear the output buffer and any recorded error.
    pub fn clear_output(&mut self) {
        self.session.clear_output();
    }

    /// Close the channel. An active session fails with a connectivity error.
    pub fn close(&mut self) {
        let was_terminal = self.channel.state().is_terminal();
        self.channel.close();
        let state = self.channel.state();
        if !was_terminal {
            self.pending.push_back(SessionEvent::Channel(state));
        }
        let events = self.session.apply(SessionSignal::ChannelLost {
            state,
            reason: "channel closed by client".to_string(),
        });
        self.pending.extend(events);
    }

    /// Apply one channel event to the session.
    pub fn dispatch(&mut self, event: ChannelEvent) -> Vec<SessionEvent> {
        match event {
            ChannelEvent::Opened => {
                tracing::info!("Channel open");
                vec![SessionEvent::Channel(ChannelState::Open)]
            }
            ChannelEvent::Message(raw) => {
                tracing::debug!(bytes = raw.len(), "Frame received");
                let signal = match protocol::decode(&raw) {
                    Ok(msg) => msg.into(),
                    Err(ProtocolError::Malformed(detail) | ProtocolError::Validation(detail)) => {
                        SessionSignal::Malformed(detail)
                    }
                };
                self.session.apply(signal)
            }
            ChannelEvent::Closed { reason } => {
                let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                self.channel_lost(ChannelState::Closed, reason)
            }
            ChannelEvent::Errored(error) => self.channel_lost(ChannelState::Errored, error),
        }
    }

    fn channel_lost(&mut self, state: ChannelState, reason: String) -> Vec<SessionEvent> {
        let mut events = vec![SessionEvent::Channel(state)];
        events.extend(self.session.apply(SessionSignal::ChannelLost { state, reason }));
        events
    }

    /// Wait for the next session event.
    ///
    /// Returns `None` once the channel has nothing more to deliver.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let Some(event) = self.channel.next_event().await else {
                // The driver went away without saying why.
                let events = self.session.apply(SessionSignal::ChannelLost {
                    state: self.channel.state(),
                    reason: "event stream ended".to_string(),
                });
                if events.is_empty() {
                    return None;
                }
                self.pending.extend(events);
                continue;
            };
            let events = self.dispatch(event);
            self.pending.extend(events);
        }
    }

    /// Like [`RunnerClient::next_event`], bounded by the idle watchdog.
    ///
    /// # Errors
    /// `IdleTimeout` if the watchdog is configured and nothing arrived in time.
    /// The session is left untouched.
    pub async fn next_event_watched(&mut self) -> Result<Option<SessionEvent>, ClientError> {
        match self.config.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.next_event())
                .await
                .map_err(|_| ClientError::IdleTimeout(limit)),
            None => Ok(self.next_event().await),
        }
    }

    /// Wait until the channel is open.
    ///
    /// Events processed while waiting, including the open event itself, stay
    /// queued for [`RunnerClient::next_event`].
    ///
    /// # Errors
    /// `ConnectTimeout` after the configured connect timeout, or the
    /// connectivity error if the channel failed.
    pub async fn wait_open(&mut self) -> Result<(), ClientError> {
        let limit = self.config.connect_timeout;
        tokio::time::timeout(limit, self.wait_open_inner())
            .await
            .map_err(|_| ClientError::ConnectTimeout(limit))?
    }

    async fn wait_open_inner(&mut self) -> Result<(), ClientError> {
        loop {
            let state = self.channel.state();
            if state.is_open() {
                return Ok(());
            }
            // The terminal event was already dispatched.
            if state.is_terminal()
                && matches!(self.session.error(), Some(SessionError::Connectivity(_)))
            {
                return Err(self.connectivity_error());
            }

            let Some(event) = self.channel.next_event().await else {
                let events = self.session.apply(SessionSignal::ChannelLost {
                    state: self.channel.state(),
                    reason: "event stream ended".to_string(),
                });
                self.pending.extend(events);
                return Err(self.connectivity_error());
            };
            let lost = matches!(event, ChannelEvent::Closed { .. } | ChannelEvent::Errored(_));
            let events = self.dispatch(event);
            self.pending.extend(events);
            if lost {
                return Err(self.connectivity_error());
            }
        }
    }

    fn connectivity_error(&self) -> ClientError {
        let err = match self.session.error() {
            Some(err @ SessionError::Connectivity(_)) => err.clone(),
            _ => SessionError::Connectivity(format!("channel {}", self.channel.state())),
        };
        ClientError::Session(err)
    }

    /// Process events until the current run completes or fails.
    ///
    /// Returns immediately if no run is in flight.
    ///
    /// # Errors
    /// `IdleTimeout` from the watchdog, `Disconnected` if the channel ended
    /// while a run was still active.
    pub async fn wait_for_completion(&mut self) -> Result<SessionStatus, ClientError> {
        loop {
            let status = self.session.status();
            if !status.is_active() && self.pending.is_empty() {
                return Ok(status);
            }
            if self.next_event_watched().await?.is_none() {
                let status = self.session.status();
                return if status.is_active() {
                    Err(ClientError::Disconnected)
                } else {
                    Ok(status)
                };
            }
        }
    }
}
