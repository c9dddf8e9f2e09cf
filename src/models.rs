//! Wire types shared by the hubs (C2/C4/C5) and the WebSocket fan-out layer (C6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalizes a session-id as it arrives on the WS surface: a bare UUID is
/// accepted and gets the conventional `visual-` prefix added; anything else
/// must already carry the prefix and a valid UUID remainder.
pub fn normalize_session_id(raw: &str) -> Option<String> {
    if let Some(rest) = raw.strip_prefix("visual-") {
        return uuid::Uuid::parse_str(rest).ok().map(|_| raw.to_string());
    }
    uuid::Uuid::parse_str(raw)
        .ok()
        .map(|_| format!("visual-{raw}"))
}

pub const EVENT_TYPE_DOM_CONTENT_LOADED: i64 = 0;
pub const EVENT_TYPE_LOAD: i64 = 1;
pub const EVENT_TYPE_FULL_SNAPSHOT: i64 = 2;
pub const EVENT_TYPE_INCREMENTAL_SNAPSHOT: i64 = 3;
pub const EVENT_TYPE_META: i64 = 4;
pub const EVENT_TYPE_CUSTOM: i64 = 5;

/// One DOM event wrapped with the bookkeeping the Session Streamer attaches.
#[derive(Debug, Clone, Serialize)]
pub struct SequencedEvent {
    pub session_id: String,
    pub received_at: DateTime<Utc>,
    pub sequence_id: u64,
    pub event: Value,
}

impl SequencedEvent {
    pub fn event_type(&self) -> Option<i64> {
        self.event.get("type").and_then(|v| v.as_i64())
    }
}

/// Per-session lifecycle phase. Transitions are one-way (Setup -> ... -> Cleanup);
/// EXECUTING is only re-entered by starting a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamingPhase {
    Setup,
    Ready,
    Executing,
    Completed,
    Cleanup,
}

impl Default for StreamingPhase {
    fn default() -> Self {
        StreamingPhase::Setup
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ready,
    Running,
    #[serde(rename = "AI-fallback")]
    AiFallback,
    Success,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFlags {
    pub workflow_use: bool,
    pub browser_use: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub step_id: String,
    pub static_step_key: String,
    pub step_index: u32,
    pub total_steps: u32,
    pub title: String,
    pub status: StepStatus,
    pub source_flags: SourceFlags,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: RunStatus,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub schema_version: u32,
    pub run_id: String,
    pub seq: u64,
    pub ts: i64,
    pub summary: RunSummary,
    pub steps: Vec<StepState>,
}

/// Per-run step/run events, each carrying a strictly monotonic `seq`. The
/// variant names double as the wire `type` tag (e.g. `"StepFinishedSuccess"`)
/// and are left PascalCase; only the fields inside each variant are
/// camelCased for the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all_fields = "camelCase")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        seq: u64,
        ts: i64,
    },
    RunEnded {
        run_id: String,
        seq: u64,
        ts: i64,
        status: RunStatus,
    },
    StepStarted {
        run_id: String,
        seq: u64,
        ts: i64,
        step_id: String,
        step_index: u32,
        total_steps: u32,
        title: String,
        static_step_key: String,
    },
    StepFinishedSuccess {
        run_id: String,
        seq: u64,
        ts: i64,
        step_id: String,
        status: &'static str,
    },
    StepFinishedFail {
        run_id: String,
        seq: u64,
        ts: i64,
        step_id: String,
        status: &'static str,
    },
    FallbackStarted {
        run_id: String,
        seq: u64,
        ts: i64,
        step_id: String,
        attempt: u32,
        max_attempts: u32,
        session_id: String,
    },
    FallbackRetryProgress {
        run_id: String,
        seq: u64,
        ts: i64,
        step_id: String,
        attempt: u32,
        max_attempts: u32,
        session_id: String,
    },
    FallbackFinishedFail {
        run_id: String,
        seq: u64,
        ts: i64,
        step_id: String,
        attempt: u32,
        max_attempts: u32,
        session_id: String,
    },
}

impl RunEvent {
    pub fn seq(&self) -> u64 {
        match self {
            RunEvent::RunStarted { seq, .. }
            | RunEvent::RunEnded { seq, .. }
            | RunEvent::StepStarted { seq, .. }
            | RunEvent::StepFinishedSuccess { seq, .. }
            | RunEvent::StepFinishedFail { seq, .. }
            | RunEvent::FallbackStarted { seq, .. }
            | RunEvent::FallbackRetryProgress { seq, .. }
            | RunEvent::FallbackFinishedFail { seq, .. } => *seq,
        }
    }
}

fn default_log_frame_type() -> String {
    "log".to_string()
}

/// A structured log record, tagged with the execution-id of whichever task
/// emitted it. Fields stay snake_case on the wire (matching `execution_id`,
/// the one field spec §6.1 calls out explicitly); only the `type` tag is
/// added on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "type", default = "default_log_frame_type")]
    pub frame_type: String,
    pub timestamp: i64,
    pub level: String,
    pub logger: String,
    pub message: String,
    pub execution_id: String,
    pub pathname: Option<String>,
    pub lineno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<bool>,
}

/// Server -> client frames on the session stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum SessionFrame {
    RrwebEvent {
        session_id: String,
        timestamp: i64,
        event: Value,
        sequence_id: u64,
    },
    ConnectionEstablished {
        client_id: String,
        session_id: String,
        timestamp: i64,
    },
    Status {
        session_id: String,
        phase: StreamingPhase,
        streaming_active: bool,
    },
    Pong {
        timestamp: i64,
    },
    SequenceResetAck {
        session_id: String,
        history_window_seconds: f64,
    },
    WorkflowCompleted {
        session_id: String,
        timestamp: i64,
        message: String,
        final_stats: FinalStats,
    },
    Error {
        error_type: String,
        error: String,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FinalStats {
    pub total_events: u64,
    pub session_duration: f64,
    pub events_per_second: f64,
}

/// Client -> server frames on the session stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum SessionClientFrame {
    Ping,
    ClientReady,
    SequenceResetRequest {
        #[serde(default)]
        history_window_seconds: Option<f64>,
    },
    #[serde(other)]
    Unknown,
}

/// Control-channel frame shapes (mouse/keyboard/wheel).
#[derive(Debug, Clone, Deserialize)]
pub struct ControlFrame {
    pub session_id: String,
    pub message: ControlMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Mouse {
        action: String,
        x: Option<f64>,
        y: Option<f64>,
    },
    Keyboard {
        action: String,
        key: Option<String>,
    },
    Wheel {
        action: String,
        #[serde(rename = "deltaX")]
        delta_x: Option<f64>,
        #[serde(rename = "deltaY")]
        delta_y: Option<f64>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlAck {
    Ack,
    Error {
        error_type: &'static str,
        error: String,
        timestamp: i64,
    },
}

/// Termination endpoint request/response shapes (§5 Cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMode {
    StopThenKill,
    Kill,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminationRequest {
    pub mode: TerminationMode,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminationResponse {
    pub success: bool,
    pub session_id: String,
    pub mode: TerminationMode,
}

impl serde::Serialize for TerminationMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = match self {
            TerminationMode::StopThenKill => "stop_then_kill",
            TerminationMode::Kill => "kill",
        };
        serializer.serialize_str(s)
    }
}
