//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module decodes them into a
//! strongly-typed [`ServerMessage`].
//!
//! The `type` discriminator is mandatory. Three kinds drive job tracking
//! (`progress`, `execution_cached`, `executing`) and a malformed payload
//! for any of them is an error. A handful of informational kinds are
//! decoded for logging only; anything unrecognised, or informational with
//! an unexpected payload, comes back as [`ServerMessage::Other`].

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Known message kinds.
pub const MSG_PROGRESS: &str = "progress";
pub const MSG_EXECUTION_CACHED: &str = "execution_cached";
pub const MSG_EXECUTING: &str = "executing";
pub const MSG_STATUS: &str = "status";
pub const MSG_EXECUTION_START: &str = "execution_start";
pub const MSG_EXECUTED: &str = "executed";
pub const MSG_EXECUTION_ERROR: &str = "execution_error";

/// A decoded ComfyUI WebSocket text frame.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Step-level progress from a long-running node (e.g. KSampler).
    Progress(ProgressData),

    /// Some nodes were skipped because their outputs are cached.
    ExecutionCached(ExecutionCachedData),

    /// A node started executing, or the prompt finished when `node` is `None`.
    Executing(ExecutingData),

    /// Server status broadcast (queue depth).
    Status(StatusData),

    /// A prompt has started executing.
    ExecutionStart(ExecutionStartData),

    /// A node has finished and produced output.
    Executed(ExecutedData),

    /// Execution failed with an error.
    ExecutionError(ErrorData),

    /// Any other kind. Carries no protocol meaning for tracking.
    Other { kind: String },
}

/// Payload for `progress` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: u32,
    /// Total number of steps.
    pub max: u32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of `prompt_id` has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    pub exception_message: String,
    pub exception_type: String,
}

/// Why a text frame could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Frame has no string 'type' discriminator")]
    MissingType,

    #[error("Malformed '{kind}' payload: {source}")]
    MalformedPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse a ComfyUI WebSocket text frame.
pub fn parse_message(text: &str) -> Result<ServerMessage, MessageError> {
    let mut envelope: serde_json::Value =
        serde_json::from_str(text).map_err(MessageError::InvalidJson)?;

    let kind = envelope
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(MessageError::MissingType)?
        .to_string();
    let data = envelope
        .get_mut("data")
        .map(serde_json::Value::take)
        .unwrap_or(serde_json::Value::Null);

    let msg = match kind.as_str() {
        MSG_PROGRESS => ServerMessage::Progress(required(&kind, data)?),
        MSG_EXECUTION_CACHED => ServerMessage::ExecutionCached(required(&kind, data)?),
        MSG_EXECUTING => ServerMessage::Executing(required(&kind, data)?),
        MSG_STATUS => informational(kind, data, ServerMessage::Status),
        MSG_EXECUTION_START => informational(kind, data, ServerMessage::ExecutionStart),
        MSG_EXECUTED => informational(kind, data, ServerMessage::Executed),
        MSG_EXECUTION_ERROR => informational(kind, data, ServerMessage::ExecutionError),
        _ => ServerMessage::Other { kind },
    };
    Ok(msg)
}

fn required<T: DeserializeOwned>(kind: &str, data: serde_json::Value) -> Result<T, MessageError> {
    serde_json::from_value(data).map_err(|source| MessageError::MalformedPayload {
        kind: kind.to_string(),
        source,
    })
}

fn informational<T: DeserializeOwned>(
    kind: String,
    data: serde_json::Value,
    wrap: fn(T) -> ServerMessage,
) -> ServerMessage {
    match serde_json::from_value(data) {
        Ok(payload) => wrap(payload),
        Err(_) => ServerMessage::Other { kind },
    }
}
