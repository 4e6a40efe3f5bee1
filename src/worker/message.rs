//! Messages crossing the isolation boundary and the merged stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pool::WorkerId;

/// Wire message emitted by an execution context, encoded as JSON text.
///
/// `{ "type": "next" | "error" | "complete", "workerId": n, "value"?: .., "error"?: ".." }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "next")]
    Next {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        value: Value,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
        error: String,
    },
    #[serde(rename = "complete")]
    Complete {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
    },
}

impl WireMessage {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            Self::Next { worker_id, .. }
            | Self::Error { worker_id, .. }
            | Self::Complete { worker_id } => *worker_id,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Item of a pool's merged result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultMessage {
    /// A value emitted by a worker.
    Value {
        worker_id: WorkerId,
        key: String,
        payload: Value,
    },
    /// The worker failed. Terminal.
    Error {
        worker_id: WorkerId,
        key: String,
        description: String,
    },
    /// The worker finished normally. Terminal.
    Complete { worker_id: WorkerId, key: String },
}

impl ResultMessage {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            Self::Value { worker_id, .. }
            | Self::Error { worker_id, .. }
            | Self::Complete { worker_id, .. } => *worker_id,
        }
    }

    /// Stable key of the task this message belongs to.
    pub fn key(&self) -> &str {
        match self {
            Self::Value { key, .. } | Self::Error { key, .. } | Self::Complete { key, .. } => key,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Value { .. })
    }

    pub(crate) fn from_wire(message: WireMessage, key: &str) -> Self {
        match message {
            WireMessage::Next { worker_id, value } => Self::Value {
                worker_id,
                key: key.to_string(),
                payload: value,
            },
            WireMessage::Error { worker_id, error } => Self::Error {
                worker_id,
                key: key.to_string(),
                description: error,
            },
            WireMessage::Complete { worker_id } => Self::Complete {
                worker_id,
                key: key.to_string(),
            },
        }
    }
}
