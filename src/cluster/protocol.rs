//! Messages exchanged between the master and its workers.
//!
//! Messages are JSON-serialized and newline-delimited, tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::DelegateId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Worker → master: stop the whole pool.
    TerminateMaster,

    /// Master → worker: exit now.
    TerminateWorker,

    /// Worker → master: run the delegation chain. With `cancel` set, asks
    /// the master to cancel the in-flight request of that id instead.
    DelegateRequest {
        request_id: DelegateId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cancel: bool,
    },

    /// Master → worker: the chain's results in handler order.
    DelegateSuccess {
        request_id: DelegateId,
        result: Vec<Value>,
    },

    /// Master → worker: the chain failed. `cancel` is set when it failed
    /// because it was cancelled.
    DelegateFailure {
        request_id: DelegateId,
        error: ErrorDescriptor,
        #[serde(default)]
        cancel: bool,
    },

    /// Application payload in either direction.
    Custom { payload: Value },
}

/// Serializable description of a failed delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl Message {
    pub fn delegate_request(request_id: DelegateId, payload: Value, timeout_ms: Option<u64>) -> Self {
        Self::DelegateRequest {
            request_id,
            timeout_ms,
            payload,
            cancel: false,
        }
    }

    pub fn cancel_request(request_id: DelegateId) -> Self {
        Self::DelegateRequest {
            request_id,
            timeout_ms: None,
            payload: Value::Null,
            cancel: true,
        }
    }

    pub fn custom(payload: Value) -> Self {
        Self::Custom { payload }
    }

    /// Name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::TerminateMaster => "TERMINATE_MASTER",
            Message::TerminateWorker => "TERMINATE_WORKER",
            Message::DelegateRequest { .. } => "DELEGATE_REQUEST",
            Message::DelegateSuccess { .. } => "DELEGATE_SUCCESS",
            Message::DelegateFailure { .. } => "DELEGATE_FAILURE",
            Message::Custom { .. } => "CUSTOM",
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
