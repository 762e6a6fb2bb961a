//! Execution session state machine.
//!
//! A [`Session`] tracks one logical run at a time. Commands (run, stop) are
//! checked against the current status and rejected, never queued, when they
//! are not allowed. Incoming signals from the backend are applied through
//! [`Session::apply`], which is the only place output is appended.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    ChannelState, RunRequest,
    error::{Command, SessionError},
    output::{Fragment, OutputBuffer},
};

/// Locally assigned identifier of a run. Never sent on the wire.
pub type RunId = Uuid;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No run has been started yet.
    #[default]
    Idle,
    /// A run was submitted and output is streaming.
    Running,
    /// A stop was requested; waiting for the backend to finish.
    Stopping,
    /// The last run ended.
    Completed,
    /// The last run was terminated by an error.
    Failed,
}

impl SessionStatus {
    /// Whether a new run may be started from this status.
    #[must_use]
    pub const fn accepts_run(self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Failed)
    }

    /// Whether a run is in flight.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    /// Whether the last run has ended, successfully or not.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Something the backend or the channel told the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// A chunk of program output.
    Stdout(String),
    /// An error notice from the backend.
    BackendError(String),
    /// The backend finished the run.
    SessionEnd { exit_code: Option<i32> },
    /// A frame that could not be decoded.
    Malformed(String),
    /// The channel closed or errored.
    ChannelLost { state: ChannelState, reason: String },
}

/// Status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Observable effect of a command or signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The channel changed state.
    Channel(ChannelState),
    /// Output was appended.
    Output(Fragment),
    /// The session changed status.
    StatusChanged(Transition),
    /// Non-fatal problem surfaced to the caller.
    Notice(SessionError),
}

/// One logical session bound to a single channel.
pub struct Session {
    status: SessionStatus,
    request: RunRequest,
    run_id: Option<RunId>,
    exit_code: Option<i32>,
    error: Option<SessionError>,
    notice: Option<SessionError>,
    output: Arc<OutputBuffer>,
    status_tx: watch::Sender<SessionStatus>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create an idle session with its own output buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_output(Arc::new(OutputBuffer::new()))
    }

    /// Create an idle session appending into `output`.
    #[must_use]
    pub fn with_output(output: Arc<OutputBuffer>) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        Self {
            status: SessionStatus::Idle,
            request: RunRequest::default(),
            run_id: None,
            exit_code: None,
            error: None,
            notice: None,
            output,
            status_tx,
        }
    }

    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    /// Request of the current or most recent run.
    #[must_use]
    pub const fn request(&self) -> &RunRequest {
        &self.request
    }

    #[must_use]
    pub const fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    /// Exit code reported by the backend for the last run, if any.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Error that terminated the last run.
    #[must_use]
    pub const fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    /// Most recent non-fatal notice.
    #[must_use]
    pub const fn last_notice(&self) -> Option<&SessionError> {
        self.notice.as_ref()
    }

    #[must_use]
    pub const fn output(&self) -> &Arc<OutputBuffer> {
        &self.output
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Check whether `request` may be started on a channel in state `channel`.
    ///
    /// # Errors
    /// `InvalidState` while a run is in flight, `Validation` for blank code,
    /// `ChannelClosed` when the channel is not open.
    pub fn check_run(&self, request: &RunRequest, channel: ChannelState) -> Result<(), SessionError> {
        if !self.status.accepts_run() {
            return Err(SessionError::InvalidState {
                command: Command::Run,
                status: self.status,
            });
        }
        if request.is_blank() {
            return Err(SessionError::Validation("source code is empty".to_string()));
        }
        if !channel.is_open() {
            return Err(SessionError::ChannelClosed);
        }
        Ok(())
    }

    /// Enter `Running` for `request`, clearing output and error state.
    ///
    /// Call only after the run frame was handed to the channel.
    ///
    /// # Errors
    /// Same as [`Session::check_run`]; nothing changes on error.
    pub fn start_run(
        &mut self,
        request: RunRequest,
        channel: ChannelState,
    ) -> Result<(RunId, Transition), SessionError> {
        self.check_run(&request, channel)?;

        let run_id = Uuid::new_v4();
        tracing::info!(%run_id, language = %request.language, "Run started");

        self.output.clear();
        self.error = None;
        self.notice = None;
        self.exit_code = None;
        self.request = request;
        self.run_id = Some(run_id);
        Ok((run_id, self.transition(SessionStatus::Running)))
    }

    /// Check whether a stop may be requested.
    ///
    /// # Errors
    /// `InvalidState` unless the session is running.
    pub fn check_stop(&self) -> Result<(), SessionError> {
        if self.status == SessionStatus::Running {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                command: Command::Stop,
                status: self.status,
            })
        }
    }

    /// Enter `Stopping`. Output is kept.
    ///
    /// # Errors
    /// Same as [`Session::check_stop`].
    pub fn begin_stop(&mut self) -> Result<Transition, SessionError> {
        self.check_stop()?;
        tracing::info!(run_id = ?self.run_id, "Stop requested");
        Ok(self.transition(SessionStatus::Stopping))
    }

    /// Apply a signal and return what it changed.
    pub fn apply(&mut self, signal: SessionSignal) -> Vec<SessionEvent> {
        match signal {
            SessionSignal::Stdout(data) => {
                if !self.status.is_active() {
                    tracing::debug!(status = %self.status, "Ignoring stdout outside a run");
                    return Vec::new();
                }
                let fragment = Fragment::stdout(data);
                self.output.append(fragment.clone());
                vec![SessionEvent::Output(fragment)]
            }
            SessionSignal::BackendError(data) => {
                let next = match self.status {
                    SessionStatus::Running => SessionStatus::Failed,
                    // The backend reporting while we wait for a stop ends the run.
                    SessionStatus::Stopping => SessionStatus::Completed,
                    status => {
                        tracing::debug!(%status, "Ignoring backend error outside a run");
                        return Vec::new();
                    }
                };
                tracing::warn!(run_id = ?self.run_id, error = %data, "Backend error");
                let fragment = Fragment::error(data.clone());
                self.output.append(fragment.clone());
                self.error = Some(SessionError::Backend(data));
                vec![
                    SessionEvent::Output(fragment),
                    SessionEvent::StatusChanged(self.transition(next)),
                ]
            }
            SessionSignal::SessionEnd { exit_code } => {
                if !self.status.is_active() {
                    tracing::debug!(status = %self.status, "Ignoring session end outside a run");
                    return Vec::new();
                }
                self.exit_code = exit_code;
                vec![SessionEvent::StatusChanged(
                    self.transition(SessionStatus::Completed),
                )]
            }
            SessionSignal::Malformed(detail) => {
                tracing::warn!(run_id = ?self.run_id, %detail, "Malformed message from backend");
                let notice = SessionError::MalformedMessage(detail);
                self.notice = Some(notice.clone());
                vec![SessionEvent::Notice(notice)]
            }
            SessionSignal::ChannelLost { state, reason } => {
                if self.status == SessionStatus::Failed {
                    return Vec::new();
                }
                tracing::warn!(run_id = ?self.run_id, %state, %reason, "Channel lost");
                self.error = Some(SessionError::Connectivity(reason));
                vec![SessionEvent::StatusChanged(
                    self.transition(SessionStatus::Failed),
                )]
            }
        }
    }

    /// Clear output and any recorded error. The status is unchanged.
    pub fn clear_output(&mut self) {
        self.output.clear();
        self.error = None;
        self.notice = None;
    }

    fn transition(&mut self, to: SessionStatus) -> Transition {
        let from = std::mem::replace(&mut self.status, to);
        self.status_tx.send_replace(to);
        tracing::debug!(run_id = ?self.run_id, %from, %to, "Session status changed");
        Transition { from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Language;

    fn running() -> Session {
        let mut session = Session::new();
        session
            .start_run(
                RunRequest::new(Language::Python, "print(1)"),
                ChannelState::Open,
            )
            .unwrap();
        session
    }

    #[test]
    fn test_run_from_idle() {
        let mut session = Session::new();
        let (run_id, t) = session
            .start_run(RunRequest::new(Language::Rust, "fn main() {}"), ChannelState::Open)
            .unwrap();

        assert_eq!(t.from, SessionStatus::Idle);
        assert_eq!(t.to, SessionStatus::Running);
        assert_eq!(session.run_id(), Some(run_id));
        assert_eq!(session.request().language, Language::Rust);
    }

    #[test]
    fn test_blank_code_rejected_for_every_language() {
        for lang in Language::ALL {
            for code in ["", "   ", "\n\t"] {
                let mut session = Session::new();
                let err = session
                    .start_run(RunRequest::new(lang, code), ChannelState::Open)
                    .unwrap_err();
                assert!(matches!(err, SessionError::Validation(_)));
                assert_eq!(session.status(), SessionStatus::Idle);
                assert!(session.run_id().is_none());
            }
        }
    }

    #[test]
    fn test_run_requires_open_channel() {
        let mut session = Session::new();
        for state in [ChannelState::Connecting, ChannelState::Closed, ChannelState::Errored] {
            let err = session
                .start_run(RunRequest::new(Language::Python, "1"), state)
                .unwrap_err();
            assert_eq!(err, SessionError::ChannelClosed);
        }
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_overlapping_run_rejected() {
        let mut session = running();
        let err = session
            .start_run(RunRequest::new(Language::Python, "2"), ChannelState::Open)
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidState {
                command: Command::Run,
                status: SessionStatus::Running,
            }
        );

        session.begin_stop().unwrap();
        assert!(
            session
                .start_run(RunRequest::new(Language::Python, "2"), ChannelState::Open)
                .is_err()
        );
    }

    #[test]
    fn test_stop_only_while_running() {
        let mut session = Session::new();
        assert!(session.begin_stop().is_err());
        assert_eq!(session.status(), SessionStatus::Idle);

        let mut session = running();
        session.begin_stop().unwrap();
        assert_eq!(session.status(), SessionStatus::Stopping);
        assert!(session.begin_stop().is_err());
    }

    #[test]
    fn test_chunks_concatenate_in_order() {
        let mut session = running();
        let chunks = ["a", "bc", "", "\n", "d"];
        for chunk in chunks {
            session.apply(SessionSignal::Stdout(chunk.to_string()));
        }
        assert_eq!(session.output().snapshot(), chunks.concat());
    }

    #[test]
    fn test_backend_error_fails_run() {
        let mut session = running();
        let events = session.apply(SessionSignal::BackendError("boom".into()));

        assert_eq!(events.len(), 2);
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.error(), Some(&SessionError::Backend("boom".into())));
        assert_eq!(session.error().unwrap().to_string(), "boom");

        // No further chunks for this run.
        assert!(session.apply(SessionSignal::Stdout("late".into())).is_empty());
        assert_eq!(session.output().snapshot(), "boom");
    }

    #[test]
    fn test_stop_keeps_accepting_output() {
        let mut session = running();
        session.apply(SessionSignal::Stdout("1".into()));
        session.begin_stop().unwrap();
        session.apply(SessionSignal::Stdout("2".into()));
        session.apply(SessionSignal::SessionEnd { exit_code: None });

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.output().snapshot(), "12");
    }

    #[test]
    fn test_error_while_stopping_completes() {
        let mut session = running();
        session.begin_stop().unwrap();
        session.apply(SessionSignal::BackendError("killed".into()));
        assert_eq!(session.status(), SessionStatus::Completed);
        assert!(session.error().is_some());
    }

    #[test]
    fn test_channel_lost_fails_exactly_once() {
        let mut session = running();
        let mut status_rx = session.subscribe_status();

        let first = session.apply(SessionSignal::ChannelLost {
            state: ChannelState::Errored,
            reason: "reset".into(),
        });
        let second = session.apply(SessionSignal::ChannelLost {
            state: ChannelState::Closed,
            reason: "closed".into(),
        });

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(
            session.error(),
            Some(&SessionError::Connectivity("reset".into()))
        );
        assert!(status_rx.has_changed().unwrap());
        assert_eq!(*status_rx.borrow_and_update(), SessionStatus::Failed);

        assert!(session.apply(SessionSignal::Stdout("late".into())).is_empty());
        assert!(session.output().is_empty());
    }

    #[test]
    fn test_malformed_is_non_fatal() {
        let mut session = running();
        let events = session.apply(SessionSignal::Malformed("not json".into()));

        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Notice(SessionError::MalformedMessage(_))]
        ));
        assert_eq!(session.status(), SessionStatus::Running);
        assert!(session.last_notice().is_some());
        assert!(session.error().is_none());
    }

    #[test]
    fn test_new_run_clears_previous() {
        let mut session = running();
        session.apply(SessionSignal::BackendError("bad".into()));
        session
            .start_run(RunRequest::new(Language::Php, "<?php echo 1;"), ChannelState::Open)
            .unwrap();

        assert_eq!(session.status(), SessionStatus::Running);
        assert!(session.output().is_empty());
        assert!(session.error().is_none());
    }

    #[test]
    fn test_signals_outside_run_ignored() {
        let mut session = Session::new();
        assert!(session.apply(SessionSignal::Stdout("x".into())).is_empty());
        assert!(session.apply(SessionSignal::SessionEnd { exit_code: Some(0) }).is_empty());
        assert!(session.apply(SessionSignal::BackendError("x".into())).is_empty());
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(session.output().is_empty());
    }

    #[test]
    fn test_session_end_records_exit_code() {
        let mut session = running();
        session.apply(SessionSignal::SessionEnd { exit_code: Some(3) });
        assert_eq!(session.exit_code(), Some(3));
        assert_eq!(session.status(), SessionStatus::Completed);
    }
}
