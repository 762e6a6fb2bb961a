//! WebSocket client channel.

use async_trait::async_trait;
use code_runner_core::ChannelState;
use futures::{SinkExt, StreamExt};
use tokio::{sync::watch, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::channel::{Channel, ChannelCore, ChannelError, ChannelEvent, DriverLink};

/// Channel over a WebSocket connection (`ws://` or `wss://`).
///
/// The socket is owned by a background task; the channel itself never blocks.
pub struct WebSocketChannel {
    core: ChannelCore,
    endpoint: String,
    driver: JoinHandle<()>,
}

impl WebSocketChannel {
    /// Start connecting to `endpoint`.
    ///
    /// Returns immediately in the `Connecting` state; an `Opened` or
    /// `Errored` event follows. Must be called inside a tokio runtime.
    #[must_use]
    pub fn open(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let (core, link) = ChannelCore::new();
        tracing::info!(%endpoint, "Connecting");
        let driver = tokio::spawn(drive(endpoint.clone(), link));
        Self {
            core,
            endpoint,
            driver,
        }
    }

    /// Endpoint this channel connects to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
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
        if self.core.close() {
            tracing::info!(endpoint = %self.endpoint, "WebSocket closed");
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        let connecting = self.core.state() == ChannelState::Connecting;
        self.core.close();
        // An open driver sends a close frame once its outbound queue is gone;
        // a pending connect is simply abandoned.
        if connecting {
            self.driver.abort();
        }
    }
}

async fn drive(endpoint: String, mut link: DriverLink) {
    let stream = match connect_async(endpoint.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::error!(%endpoint, "WebSocket connect failed: {e}");
            link.failed(e.to_string());
            return;
        }
    };

    if !link.opened() {
        // Closed by the owner while connecting.
        return;
    }
    tracing::info!(%endpoint, "WebSocket connection established");

    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            frame = link.outbound_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.close().await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    tracing::error!("WebSocket send failed: {e}");
                    link.failed(e.to_string());
                    break;
                }
            }
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => link.deliver(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) => {
                        link.deliver(String::from_utf8_lossy(&data).into_owned());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_owned())
                            .filter(|r| !r.is_empty());
                        tracing::info!(?reason, "WebSocket closed by server");
                        link.closed(reason);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {e}");
                        link.failed(e.to_string());
                        break;
                    }
                    None => {
                        link.closed(None);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_errors() {
        // Nothing listens on port 9 of the loopback interface.
        let mut channel = WebSocketChannel::open("ws://127.0.0.1:9/ws");
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert_eq!(channel.send("{}".into()), Err(ChannelError::ChannelClosed));

        let event = channel.next_event().await;
        assert!(matches!(event, Some(ChannelEvent::Errored(_))));
        assert_eq!(channel.state(), ChannelState::Errored);
    }

    #[tokio::test]
    async fn test_invalid_url_errors() {
        let mut channel = WebSocketChannel::open("not a url");
        assert!(matches!(
            channel.next_event().await,
            Some(ChannelEvent::Errored(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut channel = WebSocketChannel::open("ws://127.0.0.1:9/ws");
        channel.close();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.next_event().await, None);
    }
}
