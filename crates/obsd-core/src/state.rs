use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the protocol connection to one OBS instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four OBS outputs tracked by the stream manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stream,
    Record,
    VirtualCam,
    ReplayBuffer,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Record => "record",
            Self::VirtualCam => "virtual_cam",
            Self::ReplayBuffer => "replay_buffer",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn state_serde_is_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Authenticating).unwrap();
        assert_eq!(json, r#""authenticating""#);
        let parsed: ConnectionState = serde_json::from_str(r#""ready""#).unwrap();
        assert!(parsed.is_ready());
    }

    #[test]
    fn output_kind_display() {
        assert_eq!(OutputKind::VirtualCam.to_string(), "virtual_cam");
        assert_eq!(OutputKind::ReplayBuffer.to_string(), "replay_buffer");
    }
}
