//! Core building blocks for a streaming remote code-execution client.
//!
//! This crate provides:
//! - `Session` - Run/stop state machine for one logical session
//! - `OutputBuffer` - Ordered output with live broadcast
//! - `Language` / `RunRequest` - What gets submitted
//! - `ChannelState` - Transport lifecycle as seen by the session
//! - `SessionError` - Error taxonomy shared by all layers

pub mod channel;
pub mod error;
pub mod language;
pub mod output;
pub mod session;

pub use channel::ChannelState;
pub use error::{Command, SessionError};
pub use language::{Language, RunRequest, UnknownLanguage};
pub use output::{Fragment, FragmentKind, OutputBuffer, OutputUpdate};
pub use session::{RunId, Session, SessionEvent, SessionSignal, SessionStatus, Transition};
