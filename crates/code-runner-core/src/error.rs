//! Error taxonomy shared by every layer of the client.

use thiserror::Error;

use crate::session::SessionStatus;

/// Command issued against a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Run,
    Stop,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => f.write_str("run"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// Session error.
///
/// None of these are fatal to the process; the client surfaces them and
/// returns to a state from which a new run can be started.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Channel is not open")]
    ChannelClosed,
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Malformed message from backend: {0}")]
    MalformedMessage(String),
    #[error("{0}")]
    Backend(String),
    #[error("Connection lost: {0}")]
    Connectivity(String),
    #[error("Cannot {command} while session is {status}")]
    InvalidState {
        command: Command,
        status: SessionStatus,
    },
}
