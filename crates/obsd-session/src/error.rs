use obsd_core::protocol::close_code_name;
use obsd_core::{ProtocolError, SessionId};

/// Caller-facing errors of the session subsystem.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("obs requires authentication but no password is configured")]
    AuthenticationNotConfigured,

    #[error("request timed out")]
    RequestTimeout,

    #[error("request failed with status {code}: {}", comment.as_deref().unwrap_or("no comment"))]
    RequestFailed { code: i64, comment: Option<String> },

    #[error("request expired before the connection became ready")]
    RequestExpired,

    #[error("not connected")]
    NotConnected,

    #[error("connection closed with unrecoverable code {code} ({})", close_code_name(*code))]
    UnrecoverableCloseCode { code: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("authentication timed out")]
    AuthTimeout,

    #[error("no request tracker for session {0}")]
    TrackerNotFound(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("component not found: {0}")]
    ComponentNotFound(String),

    #[error("no cached state for session {0}")]
    CacheNotFound(SessionId),

    #[error("{0} is not running")]
    ComponentStopped(&'static str),
}

impl SessionError {
    /// Snake-case reason reported to gateway callers as `{error, reason}`.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Protocol(e) => e.error_kind(),
            Self::AuthenticationNotConfigured => "authentication_not_configured",
            Self::RequestTimeout => "request_timeout",
            Self::RequestFailed { .. } => "request_failed",
            Self::RequestExpired => "request_expired",
            Self::NotConnected => "not_connected",
            Self::UnrecoverableCloseCode { .. } => "unrecoverable_close_code",
            Self::Transport(_) => "transport_error",
            Self::ConnectTimeout => "connect_timeout",
            Self::AuthTimeout => "auth_timeout",
            Self::TrackerNotFound(_) => "tracker_not_found",
            Self::SessionNotFound(_) => "session_not_found",
            Self::ComponentNotFound(_) => "component_not_found",
            Self::CacheNotFound(_) => "cache_not_found",
            Self::ComponentStopped(_) => "component_stopped",
        }
    }
}
