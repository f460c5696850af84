use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;
use crate::state::{ConnectionState, OutputKind};

/// Normalized events a session publishes onto the shared event bus.
/// Raw protocol events that have no dedicated variant travel as `Unknown`
/// with their original name and payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    #[serde(rename = "scene_changed")]
    SceneChanged {
        session_id: SessionId,
        scene_name: String,
    },

    #[serde(rename = "stream_state_changed")]
    StreamStateChanged {
        session_id: SessionId,
        active: bool,
        state: String,
    },

    #[serde(rename = "record_state_changed")]
    RecordStateChanged {
        session_id: SessionId,
        active: bool,
        state: String,
        path: Option<String>,
    },

    #[serde(rename = "unknown")]
    Unknown {
        session_id: SessionId,
        event_type: String,
        data: Value,
    },

    /// An output's active flag went from false to true.
    #[serde(rename = "output_started")]
    OutputStarted {
        session_id: SessionId,
        output: OutputKind,
        active: bool,
    },

    /// An output's active flag went from true to false.
    #[serde(rename = "output_stopped")]
    OutputStopped {
        session_id: SessionId,
        output: OutputKind,
        active: bool,
    },

    #[serde(rename = "connection_state_changed")]
    ConnectionStateChanged {
        session_id: SessionId,
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl BusEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SceneChanged { session_id, .. }
            | Self::StreamStateChanged { session_id, .. }
            | Self::RecordStateChanged { session_id, .. }
            | Self::Unknown { session_id, .. }
            | Self::OutputStarted { session_id, .. }
            | Self::OutputStopped { session_id, .. }
            | Self::ConnectionStateChanged { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SceneChanged { .. } => "scene_changed",
            Self::StreamStateChanged { .. } => "stream_state_changed",
            Self::RecordStateChanged { .. } => "record_state_changed",
            Self::Unknown { .. } => "unknown",
            Self::OutputStarted { .. } => "output_started",
            Self::OutputStopped { .. } => "output_stopped",
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
        }
    }

    /// Build the started/stopped event for an output transition.
    pub fn output_transition(session_id: SessionId, output: OutputKind, active: bool) -> Self {
        if active {
            Self::OutputStarted {
                session_id,
                output,
                active,
            }
        } else {
            Self::OutputStopped {
                session_id,
                output,
                active,
            }
        }
    }
}
