// WebSocket message types for the slotsync.v1 protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mutation::StateMutation;
use crate::types::WorkspaceState;

pub const CURRENT_PROTOCOL_VERSION: &str = "slotsync.v1";

/// Client -> Server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Request catch-up from `since_version` (absent = full snapshot).
    Sync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_version: Option<u64>,
    },

    /// Client-authored change; goes through the same versioned log.
    Mutate { mutation: StateMutation },

    /// Client has applied everything up to and including `version`.
    Ack { version: u64 },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|error| ProtocolError::Malformed(error.to_string()))
    }
}

/// Server -> Client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full workspace state at exactly `version`.
    Snapshot { version: u64, state: WorkspaceState },

    /// Contiguous mutations `since_version + 1 ..= version`, ascending.
    Delta {
        version: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_version: Option<u64>,
        deltas: Vec<StateMutation>,
    },

    /// A client request was rejected.
    Error { code: String, message: String },
}

impl ServerMessage {
    /// Live-broadcast form carrying exactly one mutation.
    pub fn single_delta(version: u64, mutation: StateMutation) -> Self {
        Self::Delta { version, since_version: version.checked_sub(1), deltas: vec![mutation] }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error { code: code.into(), message: message.into() }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|error| ProtocolError::Encode(error.to_string()))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}
