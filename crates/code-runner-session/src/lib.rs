//! Execution session client for remote code runners.
//!
//! Provides:
//! - `RunnerClient` - Own a channel and drive one session over it
//! - `ClientConfig` - Endpoint and timeouts

pub mod client;
pub mod config;

pub use client::{ClientError, RunnerClient};
pub use code_runner_transport::Channel;
pub use config::{ClientConfig, DEFAULT_ENDPOINT};
