//! Wire contracts between a ComputeNet client and the task broker.
//!
//! Every envelope is a JSON object with a `type` discriminator and
//! type-specific fields. Inbound decoding never trusts the tag alone: each
//! known type is checked for the fields it needs before it is classified.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

pub const TASK_ACCEPTED: &str = "TASK_ACCEPTED";
pub const TASK_COMPLETED: &str = "TASK_COMPLETED";
pub const STATUS_UPDATE: &str = "STATUS_UPDATE";
pub const SUBMIT_TASK: &str = "SUBMIT_TASK";
pub const REQUEST_STATUS: &str = "REQUEST_STATUS";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope has no string type tag")]
    MissingType,
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unrecognized message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    /// The type tag carried by the envelope, when one could be read.
    pub fn raw_type(&self) -> Option<&str> {
        match self {
            ProtocolError::InvalidPayload { kind, .. } => Some(kind.as_str()),
            ProtocolError::UnknownType(kind) => Some(kind.as_str()),
            ProtocolError::Malformed(_) | ProtocolError::MissingType => None,
        }
    }
}

/// Partial counter update carried by `STATUS_UPDATE.data`.
///
/// A `None` field means "no change", never zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_workers: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tasks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_tasks: Option<u64>,
}

impl StatusPatch {
    pub fn is_empty(&self) -> bool {
        self.active_workers.is_none() && self.pending_tasks.is_none() && self.completed_tasks.is_none()
    }
}

/// Last-known broker counters. Each field stays unset until the broker first
/// reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub active_workers: Option<u64>,
    pub pending_tasks: Option<u64>,
    pub completed_tasks: Option<u64>,
}

impl DashboardSnapshot {
    /// Overwrites only the fields present in `patch`.
    pub fn merge(&mut self, patch: &StatusPatch) {
        if let Some(value) = patch.active_workers {
            self.active_workers = Some(value);
        }
        if let Some(value) = patch.pending_tasks {
            self.pending_tasks = Some(value);
        }
        if let Some(value) = patch.completed_tasks {
            self.completed_tasks = Some(value);
        }
    }
}

impl fmt::Display for DashboardSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field(value: Option<u64>) -> String {
            value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
        }
        write!(
            f,
            "active_workers={} pending_tasks={} completed_tasks={}",
            field(self.active_workers),
            field(self.pending_tasks),
            field(self.completed_tasks)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    TaskAccepted { task_id: String },
    TaskCompleted { task_id: String },
    StatusUpdate(StatusPatch),
    /// Anything that could not be classified. `raw` keeps the original text
    /// for diagnostics.
    Unknown { raw_type: Option<String>, raw: String },
}

impl InboundMessage {
    pub fn unknown(err: &ProtocolError, raw: &str) -> Self {
        InboundMessage::Unknown {
            raw_type: err.raw_type().map(str::to_string),
            raw: raw.to_string(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::TaskAccepted { .. } => TASK_ACCEPTED,
            InboundMessage::TaskCompleted { .. } => TASK_COMPLETED,
            InboundMessage::StatusUpdate(_) => STATUS_UPDATE,
            InboundMessage::Unknown { raw_type, .. } => raw_type.as_deref().unwrap_or("unknown"),
        }
    }
}

#[derive(Deserialize)]
struct TaskRef {
    #[serde(rename = "taskId", deserialize_with = "deserialize_id")]
    task_id: String,
}

#[derive(Deserialize)]
struct StatusBody {
    data: StatusCounters,
}

/// Counters as sent, before each one is checked on its own.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusCounters {
    #[serde(default)]
    active_workers: Option<Value>,
    #[serde(default)]
    pending_tasks: Option<Value>,
    #[serde(default)]
    completed_tasks: Option<Value>,
}

impl StatusCounters {
    fn into_patch(self) -> StatusPatch {
        StatusPatch {
            active_workers: counter("activeWorkers", self.active_workers),
            pending_tasks: counter("pendingTasks", self.pending_tasks),
            completed_tasks: counter("completedTasks", self.completed_tasks),
        }
    }
}

/// A counter that is not a non-negative integer is dropped from the patch;
/// its siblings still apply.
fn counter(field: &'static str, value: Option<Value>) -> Option<u64> {
    let value = value?;
    let parsed = value.as_u64();
    if parsed.is_none() && !value.is_null() {
        warn!(event = "status_counter_invalid", field, value = %value);
    }
    parsed
}

/// Strict decoding of one inbound envelope.
pub fn decode_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    match kind.as_str() {
        TASK_ACCEPTED => {
            let body: TaskRef = payload(&kind, value)?;
            Ok(InboundMessage::TaskAccepted { task_id: body.task_id })
        }
        TASK_COMPLETED => {
            let body: TaskRef = payload(&kind, value)?;
            Ok(InboundMessage::TaskCompleted { task_id: body.task_id })
        }
        STATUS_UPDATE => {
            let body: StatusBody = payload(&kind, value)?;
            Ok(InboundMessage::StatusUpdate(body.data.into_patch()))
        }
        _ => Err(ProtocolError::UnknownType(kind)),
    }
}

/// Lenient decoding: anything `decode_inbound` rejects becomes `Unknown`.
pub fn classify(text: &str) -> InboundMessage {
    match decode_inbound(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(event = "inbound_decode_failed", error = %err);
            InboundMessage::unknown(&err, text)
        }
    }
}

fn payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// The broker assigns integer ids but string ids are accepted as well.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for taskId")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundRequest {
    #[serde(rename = "SUBMIT_TASK")]
    SubmitTask {
        name: String,
        data: String,
        timestamp: String,
    },
    #[serde(rename = "REQUEST_STATUS")]
    RequestStatus,
}

impl OutboundRequest {
    pub fn submit_task(name: impl Into<String>, data: impl Into<String>, at: DateTime<Utc>) -> Self {
        OutboundRequest::SubmitTask {
            name: name.into(),
            data: data.into(),
            timestamp: format_timestamp(at),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundRequest::SubmitTask { .. } => SUBMIT_TASK,
            OutboundRequest::RequestStatus => REQUEST_STATUS,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// RFC 3339 in UTC with millisecond precision, e.g. `2026-02-07T21:00:00.000Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
