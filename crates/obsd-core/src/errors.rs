/// Errors raised by the wire codec.
///
/// None of these are fatal to a session: malformed inbound data is logged and
/// dropped, an invalid outbound request is rejected before it is sent.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
    #[error("request type must be a string")]
    InvalidRequestType,
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Short classification string for logging and caller-facing reasons.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::InvalidFormat(_) => "invalid_format",
            Self::InvalidRequestType => "invalid_request_type",
            Self::Encode(_) => "encode_error",
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
