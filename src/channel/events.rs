//! Wire events for the live progress channel.
//!
//! The backend sends tagged JSON frames. Tags map onto a closed enum so
//! consumers handle every kind exhaustively; unknown tags become
//! `Unrecognized` instead of an error.

use crate::model::ProgressUpdate;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Progress(ProgressUpdate),
    TaskUpdate(Value),
    BatchComplete(Value),
    Complete(Value),
    Error { message: String },
    Status(Value),
    /// Heartbeat acknowledgement; filtered out before dispatch.
    Pong,
    Unrecognized { kind: String, payload: Value },
}

/// Parse one text frame. Frames without a string `type` field are malformed.
pub fn parse_event(text: &str) -> Result<ChannelEvent, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let event = match kind.as_str() {
        "progress" => ChannelEvent::Progress(serde_json::from_value(value)?),
        "task_update" => ChannelEvent::TaskUpdate(value),
        "batch_complete" => ChannelEvent::BatchComplete(value),
        "complete" => ChannelEvent::Complete(value),
        "error" => ChannelEvent::Error {
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("execution failed")
                .to_string(),
        },
        "status" => ChannelEvent::Status(value),
        "pong" => ChannelEvent::Pong,
        _ => ChannelEvent::Unrecognized {
            kind,
            payload: value,
        },
    };
    Ok(event)
}

/// Consumer callbacks for one session's progress channel.
///
/// Every method defaults to a no-op, so a caller needing only some events
/// implements a partial adapter. Callback order follows transport order;
/// heartbeat acknowledgements are never delivered.
pub trait ProgressSink: Send + Sync {
    fn on_open(&self) {}
    fn on_progress(&self, _update: &ProgressUpdate) {}
    fn on_task_update(&self, _payload: &Value) {}
    fn on_batch_complete(&self, _payload: &Value) {}
    fn on_complete(&self, _payload: &Value) {}
    fn on_error(&self, _message: &str) {}
    fn on_close(&self, _reason: &str) {}
    fn on_status(&self, _payload: &Value) {}
    /// Fallback for tags this client does not recognize.
    fn on_message(&self, _kind: &str, _payload: &Value) {}
}
