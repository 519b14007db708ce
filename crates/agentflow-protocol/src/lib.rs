pub mod paths;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque identifier for a supervised run.
pub type RunId = String;

/// Well-known values of [`RunEvent::kind`].
pub mod kind {
    pub const RUN_STARTED: &str = "run_started";
    pub const PROCESS_STDOUT: &str = "process_stdout";
    pub const PROCESS_STDERR: &str = "process_stderr";
    pub const PROGRESS: &str = "progress";
    pub const RUN_FINISHED: &str = "run_finished";
    pub const ERROR: &str = "error";
}

/// Well-known values of [`RunEvent::step`].
pub mod step {
    pub const FIRE: &str = "fire";
    pub const ARCHIVE: &str = "archive";
    pub const GOVERNANCE: &str = "governance";
    pub const STREAM: &str = "stream";
}

/// Severity hint attached to every event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    #[default]
    Info,
    Warn,
    Error,
}

/// One record on the run event stream.
///
/// `seq` is assigned by the bus and is strictly increasing per `run_id`.
/// Events with an empty `run_id` are global and carry no sequence number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    #[serde(default)]
    pub ts: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: RunId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step: String,
    #[serde(default)]
    pub level: Level,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl RunEvent {
    pub fn new(
        run_id: impl Into<RunId>,
        kind: impl Into<String>,
        step: impl Into<String>,
        level: Level,
    ) -> Self {
        Self {
            ts: String::new(),
            seq: 0,
            run_id: run_id.into(),
            kind: kind.into(),
            step: step.into(),
            level,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_global(&self) -> bool {
        self.run_id.is_empty()
    }

    pub fn is_process_output(&self) -> bool {
        self.kind == kind::PROCESS_STDOUT || self.kind == kind::PROCESS_STDERR
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == kind::RUN_FINISHED
    }

    /// Returns `data[key]` when `data` is an object.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref()?.as_object()?.get(key)
    }

    /// Returns the `text` payload of a process output event.
    pub fn text(&self) -> Option<&str> {
        self.field("text")?.as_str()
    }
}

/// Current UTC time in RFC 3339 form with nanosecond precision.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("stream frame must be single-line JSON")]
    MultiLine,
}

/// Encode an event as one line of JSON with no embedded newline.
///
/// Used for both the SSE `data:` payload and the JSONL archive.
pub fn encode_frame(event: &RunEvent) -> Result<String, FrameError> {
    let line = serde_json::to_string(event)?;
    if line.contains('\n') || line.contains('\r') {
        return Err(FrameError::MultiLine);
    }
    Ok(line)
}

/// Body of `POST /api/fire`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub tool: String,
    pub max_iterations: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub ok: bool,
    pub run_id: RunId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub stopping: bool,
}

/// Error codes for structured API errors.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadJson,
    InvalidQuery,
    ValidationError,
    ResourceConflict,
    FireStartFailed,
    InternalError,
}

impl ErrorCode {
    /// HTTP status used when this code is returned from the console API.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::BadJson | ErrorCode::InvalidQuery | ErrorCode::ValidationError => 400,
            ErrorCode::ResourceConflict => 409,
            ErrorCode::FireStartFailed => 502,
            ErrorCode::InternalError => 500,
        }
    }
}

/// JSON error body returned by the console API.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_wire_names() {
        let mut event = RunEvent::new("r1", kind::PROCESS_STDOUT, step::FIRE, Level::Info)
            .with_data(json!({"text": "hello"}));
        event.seq = 3;
        event.ts = "2026-01-01T00:00:00Z".to_string();

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["runId"], "r1");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["type"], "process_stdout");
        assert_eq!(value["step"], "fire");
        assert_eq!(value["level"], "info");
        assert_eq!(value["data"]["text"], "hello");
    }

    #[test]
    fn global_event_omits_run_fields() {
        let event = RunEvent::new("", "notice", "", Level::Warn);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("runId"));
        assert!(!json.contains("seq"));
        assert!(!json.contains("data"));
        assert!(event.is_global());
    }

    #[test]
    fn decodes_minimal_event() {
        let event: RunEvent = serde_json::from_str(r#"{"type":"run_finished"}"#).unwrap();
        assert!(event.is_terminal());
        assert_eq!(event.level, Level::Info);
        assert_eq!(event.seq, 0);
    }

    #[test]
    fn frame_escapes_embedded_newlines() {
        let event = RunEvent::new("r1", kind::PROCESS_STDERR, step::FIRE, Level::Info)
            .with_data(json!({"text": "line one\nline two\r\n"}));
        let frame = encode_frame(&event).unwrap();
        assert!(!frame.contains('\n'));
        let back: RunEvent = serde_json::from_str(&frame).unwrap();
        assert_eq!(back.text(), Some("line one\nline two\r\n"));
    }

    #[test]
    fn error_codes_map_to_http_status() {
        assert_eq!(ErrorCode::ValidationError.http_status(), 400);
        assert_eq!(ErrorCode::ResourceConflict.http_status(), 409);
        assert_eq!(ErrorCode::FireStartFailed.http_status(), 502);
        assert_eq!(ErrorCode::InternalError.http_status(), 500);
        assert_eq!(
            serde_json::to_string(&ErrorCode::ResourceConflict).unwrap(),
            "\"RESOURCE_CONFLICT\""
        );
    }

    #[test]
    fn start_request_uses_camel_case() {
        let req: StartRequest =
            serde_json::from_str(r#"{"tool":"codex","maxIterations":10}"#).unwrap();
        assert_eq!(req.tool, "codex");
        assert_eq!(req.max_iterations, 10);
    }

    #[test]
    fn stop_response_omits_missing_run_id() {
        let resp = StopResponse {
            ok: true,
            run_id: None,
            stopping: false,
        };
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"ok":true,"stopping":false}"#
        );
    }
}
