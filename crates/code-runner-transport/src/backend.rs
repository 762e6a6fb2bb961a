//! Echo backend speaking the runner protocol.
//!
//! Nothing submitted is executed: a run streams the submitted code back line
//! by line, then the stdin text, then ends with exit code 0. Useful for
//! exercising clients end to end.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tower_http::trace::TraceLayer;

use crate::protocol::{self, ClientMessage, ServerMessage};

/// Echo backend configuration.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    /// Pause between streamed chunks.
    pub chunk_delay: Duration,
}

impl EchoBackend {
    #[must_use]
    pub const fn new(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }

    /// Chunks a run of `code` with `input` produces, in order.
    #[must_use]
    pub fn chunks(code: &str, input: &str) -> Vec<String> {
        let mut chunks: Vec<String> = code.split_inclusive('\n').map(str::to_owned).collect();
        if !input.is_empty() {
            chunks.push(input.to_owned());
        }
        chunks
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(backend): State<Arc<EchoBackend>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, backend))
}

async fn handle_socket(socket: WebSocket, backend: Arc<EchoBackend>) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = protocol::encode_server(&msg);
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut current: Option<JoinHandle<()>> = None;

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => {
                if let Ok(s) = String::from_utf8(data.to_vec()) {
                    s
                } else {
                    tracing::warn!("Binary frame is not UTF-8");
                    let _ = tx.send(ServerMessage::error("Invalid message: frame is not UTF-8"));
                    continue;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg = match protocol::decode_client(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = tx.send(ServerMessage::error(format!("Invalid message: {e}")));
                continue;
            }
        };

        let running = current.as_ref().is_some_and(|task| !task.is_finished());

        match client_msg {
            ClientMessage::Run {
                code,
                language,
                input,
            } => {
                if running {
                    let _ = tx.send(ServerMessage::error("A run is already in progress"));
                    continue;
                }
                tracing::info!(%language, bytes = code.len(), "Echoing run");
                let chunks = EchoBackend::chunks(&code, &input);
                let delay = backend.chunk_delay;
                let tx = tx.clone();
                current = Some(tokio::spawn(async move {
                    for chunk in chunks {
                        if tx.send(ServerMessage::Stdout { data: chunk }).is_err() {
                            return;
                        }
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    let _ = tx.send(ServerMessage::SessionEnd { exit_code: Some(0) });
                }));
            }
            ClientMessage::Stop => {
                if let Some(task) = current.take().filter(|_| running) {
                    task.abort();
                    tracing::info!("Run stopped");
                    let _ = tx.send(ServerMessage::SessionEnd { exit_code: None });
                }
            }
        }
    }

    if let Some(task) = current {
        task.abort();
    }
    drop(tx);
    let _ = send_task.await;
}

/// Create the backend router, serving the protocol at `/ws`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_router(EchoBackend::default()));
/// ```
#[must_use]
pub fn create_router(backend: EchoBackend) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(backend))
}
