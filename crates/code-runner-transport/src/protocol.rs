//! Wire protocol for client-server communication.
//!
//! Frames are JSON text. Client frames are tagged by `command`, server frames
//! by `type`; the split into two enums keeps each direction honest.

use code_runner_core::{Language, RunRequest, SessionError, SessionSignal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Execute code.
    Run {
        code: String,
        language: Language,
        #[serde(default)]
        input: String,
    },
    /// Halt the current execution.
    Stop,
}

impl From<RunRequest> for ClientMessage {
    fn from(request: RunRequest) -> Self {
        Self::Run {
            code: request.code,
            language: request.language,
            input: request.input,
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Program output chunk.
    Stdout { data: String },
    /// Error notice, shown verbatim.
    Error { data: String },
    /// The run finished.
    SessionEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl ServerMessage {
    #[must_use]
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout { data: data.into() }
    }

    #[must_use]
    pub fn error(data: impl Into<String>) -> Self {
        Self::Error { data: data.into() }
    }
}

impl From<ServerMessage> for SessionSignal {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Stdout { data } => Self::Stdout(data),
            ServerMessage::Error { data } => Self::BackendError(data),
            ServerMessage::SessionEnd { exit_code } => Self::SessionEnd { exit_code },
        }
    }
}

/// Codec error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Validation(msg) => Self::Validation(msg),
            ProtocolError::Malformed(msg) => Self::MalformedMessage(msg),
        }
    }
}

fn to_frame<T: Serialize>(msg: &T) -> String {
    // Plain enums of strings and integers always serialize.
    serde_json::to_string(msg).unwrap_or_default()
}

/// Encode a run frame.
///
/// # Errors
/// Returns `Validation` if the code is empty or whitespace only.
pub fn encode_run(request: &RunRequest) -> Result<String, ProtocolError> {
    if request.is_blank() {
        return Err(ProtocolError::Validation("source code is empty".to_string()));
    }
    Ok(to_frame(&ClientMessage::from(request.clone())))
}

/// Encode a stop frame.
#[must_use]
pub fn encode_stop() -> String {
    to_frame(&ClientMessage::Stop)
}

/// Encode a server frame.
#[must_use]
pub fn encode_server(msg: &ServerMessage) -> String {
    to_frame(msg)
}

/// Decode a frame sent by the server.
///
/// # Errors
/// Returns `Malformed` if the payload is not JSON or has no recognized `type`.
pub fn decode(raw: &str) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decode a frame sent by a client.
///
/// # Errors
/// Returns `Malformed` if the payload is not JSON or has no recognized `command`.
pub fn decode_client(raw: &str) -> Result<ClientMessage, ProtocolError> {
    serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_run_wire_shape() {
        let request = RunRequest::new(Language::Python, "print(1)").with_input("42");
        let frame = encode_run(&request).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(
            value,
            json!({"command": "run", "code": "print(1)", "language": "python", "input": "42"})
        );
    }

    #[test]
    fn test_stop_wire_shape() {
        let value: Value = serde_json::from_str(&encode_stop()).unwrap();
        assert_eq!(value, json!({"command": "stop"}));
    }

    #[test]
    fn test_blank_run_rejected() {
        for code in ["", "  ", "\n"] {
            let err = encode_run(&RunRequest::new(Language::Java, code)).unwrap_err();
            assert!(matches!(err, ProtocolError::Validation(_)));
        }
    }

    #[test]
    fn test_run_roundtrip() {
        let request = RunRequest::new(Language::Cpp, "int main() {}").with_input("a\nb");
        let decoded = decode_client(&encode_run(&request).unwrap()).unwrap();
        assert_eq!(decoded, ClientMessage::from(request));
    }

    #[test]
    fn test_decode_server_messages() {
        assert_eq!(
            decode(r#"{"type":"stdout","data":"1"}"#).unwrap(),
            ServerMessage::stdout("1")
        );
        assert_eq!(
            decode(r#"{"type":"error","data":"boom","extra":true}"#).unwrap(),
            ServerMessage::error("boom")
        );
        assert_eq!(
            decode(r#"{"type":"session_end"}"#).unwrap(),
            ServerMessage::SessionEnd { exit_code: None }
        );
        assert_eq!(
            decode(r#"{"type":"session_end","exit_code":2}"#).unwrap(),
            ServerMessage::SessionEnd { exit_code: Some(2) }
        );
    }

    #[test]
    fn test_decode_malformed() {
        for raw in [
            "not json",
            "{}",
            r#"{"type":"bogus","data":"x"}"#,
            r#"{"type":"stdout"}"#,
            r#"["stdout"]"#,
        ] {
            assert!(
                matches!(decode(raw), Err(ProtocolError::Malformed(_))),
                "{raw} should be malformed"
            );
        }
    }

    #[test]
    fn test_direction_is_enforced() {
        // A client frame is not a valid server frame and vice versa.
        assert!(decode(&encode_stop()).is_err());
        assert!(decode_client(&encode_server(&ServerMessage::stdout("x"))).is_err());
    }

    #[test]
    fn test_session_end_omits_null_exit_code() {
        let frame = encode_server(&ServerMessage::SessionEnd { exit_code: None });
        assert_eq!(frame, r#"{"type":"session_end"}"#);
    }
}
