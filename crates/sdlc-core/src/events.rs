//! Push-feed event contract.
//!
//! Frames on `/ws/events` are JSON objects `{type, timestamp, run_id?, data}`.
//! `data` is decoded here, at the boundary, into a typed [`EventPayload`];
//! anything unrecognised lands in [`EventPayload::Other`] untouched.

use crate::{deserialize_non_empty, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PHASE_STARTED: &str = "phase.started";
pub const PHASE_COMPLETED: &str = "phase.completed";
pub const PHASE_GATE: &str = "phase.gate";
pub const ISSUE_STATUS_CHANGED: &str = "issue.status_changed";
pub const AGENT_SPAWNED: &str = "agent.spawned";
pub const AGENT_OUTPUT: &str = "agent.output";
pub const AGENT_COMPLETED: &str = "agent.completed";
pub const METRICS_UPDATED: &str = "metrics.updated";
pub const PIPELINE_ERROR: &str = "error";
pub const EXECUTION_STARTED: &str = "execution.started";
pub const EXECUTION_OUTPUT: &str = "execution.output";
pub const EXECUTION_MESSAGE: &str = "execution.message";
pub const EXECUTION_COMPLETED: &str = "execution.completed";
pub const EXECUTION_FAILED: &str = "execution.failed";
pub const EXECUTION_WAITING_INPUT: &str = "execution.waiting_input";
pub const EXECUTION_CANCELLED: &str = "execution.cancelled";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("event frame is not valid json: {0}")]
    Json(String),
    #[error("event frame has no type")]
    MissingType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseStarted {
    #[serde(default)]
    pub phase: String,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub execution_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseCompleted {
    #[serde(default)]
    pub phase: String,
    #[serde(default, deserialize_with = "deserialize_lenient_i64")]
    pub duration_ms: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseGate {
    #[serde(default)]
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueStatusChanged {
    pub issue_id: String,
    pub status: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentActivity {
    pub agent: String,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub issue: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentOutput {
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub issue_id: Option<String>,
    #[serde(default)]
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineError {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub error: String,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionStarted {
    pub execution_id: String,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub run_id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub issue_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub execution_id: String,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionMessageAppended {
    pub execution_id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// A status-defining transition. The frame `type` is authoritative for
/// `status`; the `status` data field is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionTransition {
    pub execution_id: String,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub run_id: Option<String>,
    #[serde(skip_deserializing, default = "transition_placeholder")]
    pub status: ExecutionStatus,
}

fn transition_placeholder() -> ExecutionStatus {
    ExecutionStatus::Completed
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    PhaseStarted(PhaseStarted),
    PhaseCompleted(PhaseCompleted),
    PhaseGate(PhaseGate),
    IssueStatusChanged(IssueStatusChanged),
    AgentSpawned(AgentActivity),
    AgentOutput(AgentOutput),
    AgentCompleted(AgentActivity),
    MetricsUpdated(Map<String, Value>),
    Error(PipelineError),
    ExecutionStarted(ExecutionStarted),
    ExecutionOutput(ExecutionOutput),
    ExecutionMessage(ExecutionMessageAppended),
    ExecutionTransition(ExecutionTransition),
    Other { event_type: String, data: Value },
}

impl EventPayload {
    pub fn event_type(&self) -> &str {
        match self {
            EventPayload::PhaseStarted(_) => PHASE_STARTED,
            EventPayload::PhaseCompleted(_) => PHASE_COMPLETED,
            EventPayload::PhaseGate(_) => PHASE_GATE,
            EventPayload::IssueStatusChanged(_) => ISSUE_STATUS_CHANGED,
            EventPayload::AgentSpawned(_) => AGENT_SPAWNED,
            EventPayload::AgentOutput(_) => AGENT_OUTPUT,
            EventPayload::AgentCompleted(_) => AGENT_COMPLETED,
            EventPayload::MetricsUpdated(_) => METRICS_UPDATED,
            EventPayload::Error(_) => PIPELINE_ERROR,
            EventPayload::ExecutionStarted(_) => EXECUTION_STARTED,
            EventPayload::ExecutionOutput(_) => EXECUTION_OUTPUT,
            EventPayload::ExecutionMessage(_) => EXECUTION_MESSAGE,
            EventPayload::ExecutionTransition(transition) => transition_type(transition.status),
            EventPayload::Other { event_type, .. } => event_type,
        }
    }

    /// Execution the payload refers to, if any.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            EventPayload::PhaseStarted(payload) => payload.execution_id.as_deref(),
            EventPayload::PhaseCompleted(payload) => payload.execution_id.as_deref(),
            EventPayload::Error(payload) => payload.execution_id.as_deref(),
            EventPayload::ExecutionStarted(payload) => Some(&payload.execution_id),
            EventPayload::ExecutionOutput(payload) => Some(&payload.execution_id),
            EventPayload::ExecutionMessage(payload) => Some(&payload.execution_id),
            EventPayload::ExecutionTransition(payload) => Some(&payload.execution_id),
            EventPayload::Other { data, .. } => data.get("execution_id").and_then(Value::as_str),
            _ => None,
        }
    }

    fn data(&self) -> Value {
        let encoded = match self {
            EventPayload::PhaseStarted(payload) => serde_json::to_value(payload),
            EventPayload::PhaseCompleted(payload) => serde_json::to_value(payload),
            EventPayload::PhaseGate(payload) => serde_json::to_value(payload),
            EventPayload::IssueStatusChanged(payload) => serde_json::to_value(payload),
            EventPayload::AgentSpawned(payload) | EventPayload::AgentCompleted(payload) => {
                serde_json::to_value(payload)
            }
            EventPayload::AgentOutput(payload) => serde_json::to_value(payload),
            EventPayload::MetricsUpdated(map) => Ok(Value::Object(map.clone())),
            EventPayload::Error(payload) => serde_json::to_value(payload),
            EventPayload::ExecutionStarted(payload) => serde_json::to_value(payload),
            EventPayload::ExecutionOutput(payload) => serde_json::to_value(payload),
            EventPayload::ExecutionMessage(payload) => serde_json::to_value(payload),
            EventPayload::ExecutionTransition(payload) => serde_json::to_value(payload),
            EventPayload::Other { data, .. } => Ok(data.clone()),
        };
        encoded.unwrap_or(Value::Null)
    }
}

fn transition_type(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Completed => EXECUTION_COMPLETED,
        ExecutionStatus::Failed => EXECUTION_FAILED,
        ExecutionStatus::WaitingInput => EXECUTION_WAITING_INPUT,
        ExecutionStatus::Cancelled => EXECUTION_CANCELLED,
        // `running` is announced as execution.started
        ExecutionStatus::Running => EXECUTION_STARTED,
    }
}

fn transition_status(event_type: &str) -> Option<ExecutionStatus> {
    match event_type {
        EXECUTION_COMPLETED => Some(ExecutionStatus::Completed),
        EXECUTION_FAILED => Some(ExecutionStatus::Failed),
        EXECUTION_WAITING_INPUT => Some(ExecutionStatus::WaitingInput),
        EXECUTION_CANCELLED => Some(ExecutionStatus::Cancelled),
        _ => None,
    }
}

/// One server-pushed notification. Advisory only: consumers re-fetch
/// rather than apply it as state.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: String,
    pub run_id: Option<String>,
    pub payload: EventPayload,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    timestamp: Value,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    run_id: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Event {
    pub fn decode(text: &str) -> Result<Self, EventDecodeError> {
        Self::decode_slice(text.as_bytes())
    }

    pub fn decode_slice(bytes: &[u8]) -> Result<Self, EventDecodeError> {
        let raw: RawEvent =
            serde_json::from_slice(bytes).map_err(|err| EventDecodeError::Json(err.to_string()))?;
        let event_type = raw.event_type.trim().to_string();
        if event_type.is_empty() {
            return Err(EventDecodeError::MissingType);
        }
        let timestamp = match raw.timestamp {
            Value::String(value) => value,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Ok(Self {
            timestamp,
            run_id: raw.run_id,
            payload: decode_payload(event_type, raw.data),
        })
    }

    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.payload.execution_id()
    }

    /// Status the event announces for `execution_id`, when it is one of the
    /// status-defining transitions (completed, failed, waiting_input, cancelled).
    pub fn transition_for(&self, execution_id: &str) -> Option<ExecutionStatus> {
        match &self.payload {
            EventPayload::ExecutionTransition(transition)
                if transition.execution_id == execution_id =>
            {
                Some(transition.status)
            }
            _ => None,
        }
    }

    /// Events without a run id are global and relevant to every run.
    pub fn is_for_run(&self, run_id: &str) -> bool {
        match self.run_id.as_deref() {
            None => true,
            Some(event_run) => event_run == run_id,
        }
    }

    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.event_type())?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        if let Some(run_id) = &self.run_id {
            map.serialize_entry("run_id", run_id)?;
        }
        map.serialize_entry("data", &self.payload.data())?;
        map.end()
    }
}

fn decode_payload(event_type: String, data: Value) -> EventPayload {
    let decoded = match event_type.as_str() {
        PHASE_STARTED => typed(&data).map(EventPayload::PhaseStarted),
        PHASE_COMPLETED => typed(&data).map(EventPayload::PhaseCompleted),
        PHASE_GATE => typed(&data).map(EventPayload::PhaseGate),
        ISSUE_STATUS_CHANGED => typed(&data).map(EventPayload::IssueStatusChanged),
        AGENT_SPAWNED => typed(&data).map(EventPayload::AgentSpawned),
        AGENT_OUTPUT => typed(&data).map(EventPayload::AgentOutput),
        AGENT_COMPLETED => typed(&data).map(EventPayload::AgentCompleted),
        METRICS_UPDATED => data.as_object().cloned().map(EventPayload::MetricsUpdated),
        PIPELINE_ERROR => typed(&data).map(EventPayload::Error),
        EXECUTION_STARTED => typed(&data).map(EventPayload::ExecutionStarted),
        EXECUTION_OUTPUT => typed(&data).map(EventPayload::ExecutionOutput),
        EXECUTION_MESSAGE => typed(&data).map(EventPayload::ExecutionMessage),
        other => transition_status(other).and_then(|status| {
            typed::<ExecutionTransition>(&data).map(|mut transition| {
                transition.status = status;
                EventPayload::ExecutionTransition(transition)
            })
        }),
    };
    decoded.unwrap_or(EventPayload::Other { event_type, data })
}

fn typed<T: DeserializeOwned>(data: &Value) -> Option<T> {
    T::deserialize(data).ok()
}

/// Accepts `12`, `"12"` or `null`; the server formats some counters as strings.
fn deserialize_lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| de::Error::custom("expected integer")),
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed.parse::<i64>().map(Some).map_err(de::Error::custom)
        }
        Some(_) => Err(de::Error::custom("expected integer or string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_frames_decode_to_typed_status() {
        let event = Event::decode(
            r#"{"type":"execution.waiting_input","timestamp":"2026-02-07T21:00:00Z","run_id":"run-1",
                "data":{"execution_id":"exec-9","run_id":"run-1","status":"waiting_input"}}"#,
        )
        .expect("decode");

        assert_eq!(event.event_type(), EXECUTION_WAITING_INPUT);
        assert_eq!(event.execution_id(), Some("exec-9"));
        assert_eq!(
            event.transition_for("exec-9"),
            Some(ExecutionStatus::WaitingInput)
        );
        assert_eq!(event.transition_for("exec-other"), None);
        assert!(event.occurred_at().is_some());
    }

    #[test]
    fn output_events_are_not_transitions() {
        let event = Event::decode(
            r#"{"type":"execution.output","timestamp":"2026-02-07T21:00:00Z",
                "data":{"execution_id":"exec-9","progress":"Reading files"}}"#,
        )
        .expect("decode");
        assert_eq!(event.execution_id(), Some("exec-9"));
        assert_eq!(event.transition_for("exec-9"), None);
        assert!(matches!(event.payload, EventPayload::ExecutionOutput(_)));
    }

    #[test]
    fn duration_accepts_string_counter() {
        let event = Event::decode(
            r#"{"type":"phase.completed","timestamp":"2026-02-07T21:00:00Z",
                "data":{"phase":"design","duration_ms":"1532","execution_id":"exec-1"}}"#,
        )
        .expect("decode");
        match event.payload {
            EventPayload::PhaseCompleted(payload) => {
                assert_eq!(payload.duration_ms, Some(1532));
                assert_eq!(payload.execution_id.as_deref(), Some("exec-1"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn unknown_types_and_mismatched_shapes_fall_into_other() {
        let unknown = Event::decode(r#"{"type":"repo.synced","timestamp":"t","data":{"x":1}}"#)
            .expect("decode unknown");
        assert_eq!(unknown.event_type(), "repo.synced");
        assert!(matches!(unknown.payload, EventPayload::Other { .. }));

        let mismatched =
            Event::decode(r#"{"type":"execution.completed","timestamp":"t","data":{"status":1}}"#)
                .expect("decode mismatched");
        assert_eq!(mismatched.event_type(), EXECUTION_COMPLETED);
        assert!(matches!(mismatched.payload, EventPayload::Other { .. }));
        assert_eq!(mismatched.transition_for(""), None);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            Event::decode("not json"),
            Err(EventDecodeError::Json(_))
        ));
        assert_eq!(
            Event::decode(r#"{"timestamp":"t","data":{}}"#),
            Err(EventDecodeError::MissingType)
        );
    }

    #[test]
    fn run_scope_treats_missing_run_as_global() {
        let global =
            Event::decode(r#"{"type":"phase.gate","timestamp":"t","data":{"phase":"design"}}"#)
                .expect("decode global");
        let scoped = Event::decode(
            r#"{"type":"phase.gate","timestamp":"t","run_id":"run-2","data":{"phase":"design"}}"#,
        )
        .expect("decode scoped");
        assert!(global.is_for_run("run-1"));
        assert!(scoped.is_for_run("run-2"));
        assert!(!scoped.is_for_run("run-1"));
    }

    #[test]
    fn serialized_event_keeps_wire_shape() {
        let event = Event::decode(
            r#"{"type":"execution.cancelled","timestamp":"2026-02-07T21:00:00Z","run_id":"run-1",
                "data":{"execution_id":"exec-3","run_id":"run-1"}}"#,
        )
        .expect("decode");
        let encoded = serde_json::to_value(&event).expect("encode");
        assert_eq!(encoded["type"], "execution.cancelled");
        assert_eq!(encoded["run_id"], "run-1");
        assert_eq!(encoded["data"]["execution_id"], "exec-3");
    }
}
