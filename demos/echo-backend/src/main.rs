//! Local echo backend for trying the runner client.
//!
//! Run with: cargo run -p echo-backend
//!
//! Then point the client at ws://127.0.0.1:3000/ws.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::Parser;
use code_runner_transport::backend::{EchoBackend, create_router};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(version, about = "Echo backend speaking the code runner protocol")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3000", env = "ECHO_BACKEND_ADDR")]
    addr: SocketAddr,

    /// Pause between streamed chunks, in milliseconds.
    #[arg(long, default_value_t = 100)]
    chunk_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let backend = EchoBackend::new(Duration::from_millis(args.chunk_delay_ms));

    let app = axum::Router::new()
        .merge(create_router(backend))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    tracing::info!("Echo backend listening on ws://{}/ws", args.addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
