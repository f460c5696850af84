//! OBS WebSocket v5 wire codec.
//!
//! Frames are UTF-8 JSON objects of the form `{"op": <int>, "d": {...}}`.
//! Everything in this module is pure: no sockets, no state. Object keys are
//! always strings after decoding, at every depth, so a decoded payload can be
//! re-encoded and decoded again without changing shape or value types.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::ProtocolError;

/// Highest RPC version this client speaks.
pub const RPC_VERSION: u32 = 1;

/// Operation codes defined by the protocol. Opcode 4 is unassigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    Hello,
    Identify,
    Identified,
    Reidentify,
    Event,
    Request,
    RequestResponse,
    RequestBatch,
    RequestBatchResponse,
}

impl OpCode {
    pub const ALL: [OpCode; 9] = [
        Self::Hello,
        Self::Identify,
        Self::Identified,
        Self::Reidentify,
        Self::Event,
        Self::Request,
        Self::RequestResponse,
        Self::RequestBatch,
        Self::RequestBatchResponse,
    ];

    pub fn from_i64(op: i64) -> Option<Self> {
        match op {
            0 => Some(Self::Hello),
            1 => Some(Self::Identify),
            2 => Some(Self::Identified),
            3 => Some(Self::Reidentify),
            5 => Some(Self::Event),
            6 => Some(Self::Request),
            7 => Some(Self::RequestResponse),
            8 => Some(Self::RequestBatch),
            9 => Some(Self::RequestBatchResponse),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Hello => 0,
            Self::Identify => 1,
            Self::Identified => 2,
            Self::Reidentify => 3,
            Self::Event => 5,
            Self::Request => 6,
            Self::RequestResponse => 7,
            Self::RequestBatch => 8,
            Self::RequestBatchResponse => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hello => "Hello",
            Self::Identify => "Identify",
            Self::Identified => "Identified",
            Self::Reidentify => "Reidentify",
            Self::Event => "Event",
            Self::Request => "Request",
            Self::RequestResponse => "RequestResponse",
            Self::RequestBatch => "RequestBatch",
            Self::RequestBatchResponse => "RequestBatchResponse",
        }
    }
}

/// Human-readable name for a raw opcode, `Unknown(<n>)` for undefined values.
pub fn opcode_name(op: i64) -> String {
    match OpCode::from_i64(op) {
        Some(code) => code.name().to_string(),
        None => format!("Unknown({op})"),
    }
}

/// A decoded protocol frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub op: i64,
    pub d: Value,
}

impl Frame {
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_i64(self.op)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode(self.op, &self.d)
    }
}

// ── Encoding ────────────────────────────────────────────────────────────────

/// Serialize `{"op": op, "d": payload}` to a text frame.
pub fn encode(op: i64, payload: &Value) -> Result<String, ProtocolError> {
    serde_json::to_string(&json!({ "op": op, "d": payload }))
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Server greeting. Only servers send this; the client uses it in tests and
/// mocks.
pub fn encode_hello(
    obs_websocket_version: &str,
    rpc_version: u32,
    authentication: Option<&AuthChallenge>,
) -> Result<String, ProtocolError> {
    let mut d = Map::new();
    d.insert("obsWebSocketVersion".into(), json!(obs_websocket_version));
    d.insert("rpcVersion".into(), json!(rpc_version));
    if let Some(auth) = authentication {
        d.insert(
            "authentication".into(),
            json!({ "challenge": auth.challenge, "salt": auth.salt }),
        );
    }
    encode(OpCode::Hello.as_i64(), &Value::Object(d))
}

/// Identify reply to Hello. `authentication` and `event_subscriptions` are
/// omitted from the payload when unset.
pub fn encode_identify(
    rpc_version: u32,
    authentication: Option<&str>,
    event_subscriptions: Option<EventSubscription>,
) -> Result<String, ProtocolError> {
    let mut d = Map::new();
    d.insert("rpcVersion".into(), json!(rpc_version));
    if let Some(auth) = authentication {
        d.insert("authentication".into(), json!(auth));
    }
    if let Some(subs) = event_subscriptions {
        d.insert("eventSubscriptions".into(), json!(subs.bits()));
    }
    encode(OpCode::Identify.as_i64(), &Value::Object(d))
}

/// Change the event subscriptions of an identified session.
pub fn encode_reidentify(
    event_subscriptions: Option<EventSubscription>,
) -> Result<String, ProtocolError> {
    let mut d = Map::new();
    if let Some(subs) = event_subscriptions {
        d.insert("eventSubscriptions".into(), json!(subs.bits()));
    }
    encode(OpCode::Reidentify.as_i64(), &Value::Object(d))
}

/// A single request. `request_data` is omitted when `None` or JSON null.
pub fn encode_request(
    request_type: &str,
    request_id: &str,
    request_data: Option<&Value>,
) -> Result<String, ProtocolError> {
    let mut d = Map::new();
    d.insert("requestType".into(), json!(request_type));
    d.insert("requestId".into(), json!(request_id));
    if let Some(data) = request_data.filter(|v| !v.is_null()) {
        d.insert("requestData".into(), data.clone());
    }
    encode(OpCode::Request.as_i64(), &Value::Object(d))
}

/// One entry of a request batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub request_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

impl BatchRequest {
    pub fn new(request_type: impl Into<String>, request_data: Option<Value>) -> Self {
        Self {
            request_type: request_type.into(),
            request_data,
        }
    }
}

/// How OBS executes the requests of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchExecution {
    None,
    SerialRealtime,
    SerialFrame,
    Parallel,
}

impl BatchExecution {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::None => -1,
            Self::SerialRealtime => 0,
            Self::SerialFrame => 1,
            Self::Parallel => 2,
        }
    }
}

/// A request batch. `haltOnFailure` and `executionType` are omitted entirely
/// when unset.
pub fn encode_request_batch(
    request_id: &str,
    requests: &[BatchRequest],
    halt_on_failure: Option<bool>,
    execution_type: Option<BatchExecution>,
) -> Result<String, ProtocolError> {
    let mut d = Map::new();
    d.insert("requestId".into(), json!(request_id));
    let requests =
        serde_json::to_value(requests).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    d.insert("requests".into(), requests);
    if let Some(halt) = halt_on_failure {
        d.insert("haltOnFailure".into(), json!(halt));
    }
    if let Some(exec) = execution_type {
        d.insert("executionType".into(), json!(exec.as_i64()));
    }
    encode(OpCode::RequestBatch.as_i64(), &Value::Object(d))
}

// ── Decoding ────────────────────────────────────────────────────────────────

/// Decode a text frame.
///
/// Malformed JSON yields [`ProtocolError::Decode`]; valid JSON that is not an
/// object carrying an integer `op` and a `d` field yields
/// [`ProtocolError::InvalidFormat`].
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut map) = value else {
        return Err(ProtocolError::InvalidFormat(
            "top-level value is not an object".into(),
        ));
    };
    let op = map
        .get("op")
        .and_then(Value::as_i64)
        .ok_or_else(|| ProtocolError::InvalidFormat("missing integer field `op`".into()))?;
    let d = map
        .remove("d")
        .ok_or_else(|| ProtocolError::InvalidFormat("missing field `d`".into()))?;
    Ok(Frame { op, d })
}

/// Decode a binary frame carrying UTF-8 JSON.
pub fn decode_bytes(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    decode(text)
}

fn payload<T: serde::de::DeserializeOwned>(d: &Value, what: &str) -> Result<T, ProtocolError> {
    T::deserialize(d).map_err(|e| ProtocolError::InvalidFormat(format!("{what}: {e}")))
}

/// Authentication parameters offered in Hello.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

/// Payload of opcode 0.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    #[serde(default)]
    pub obs_web_socket_version: Option<String>,
    pub rpc_version: u32,
    #[serde(default)]
    pub authentication: Option<AuthChallenge>,
}

impl HelloPayload {
    pub fn from_value(d: &Value) -> Result<Self, ProtocolError> {
        payload(d, "hello")
    }
}

/// Payload of opcode 2.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifiedPayload {
    pub negotiated_rpc_version: u32,
}

impl IdentifiedPayload {
    pub fn from_value(d: &Value) -> Result<Self, ProtocolError> {
        payload(d, "identified")
    }
}

/// Outcome block of a request response.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RequestStatus {
    pub result: bool,
    pub code: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Payload of opcode 7.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_type: String,
    pub request_id: String,
    pub request_status: RequestStatus,
    #[serde(default)]
    pub response_data: Option<Value>,
}

impl RequestResponse {
    pub fn from_value(d: &Value) -> Result<Self, ProtocolError> {
        payload(d, "request response")
    }
}

/// Payload of opcode 9.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatchResponse {
    pub request_id: String,
    #[serde(default)]
    pub results: Vec<Value>,
}

impl RequestBatchResponse {
    pub fn from_value(d: &Value) -> Result<Self, ProtocolError> {
        payload(d, "request batch response")
    }
}

/// Payload of opcode 5.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub event_type: String,
    #[serde(default)]
    pub event_intent: Option<u64>,
    #[serde(default)]
    pub event_data: Option<Value>,
}

impl EventPayload {
    /// Parse an event payload. `eventData`, when present and not null, must be
    /// an object.
    pub fn from_value(d: &Value) -> Result<Self, ProtocolError> {
        let event: Self = payload(d, "event")?;
        match &event.event_data {
            None | Some(Value::Null) | Some(Value::Object(_)) => Ok(event),
            Some(other) => Err(ProtocolError::InvalidFormat(format!(
                "event data for {} is not an object: {other}",
                event.event_type
            ))),
        }
    }

    /// Event data as an object, empty when absent.
    pub fn data(&self) -> Map<String, Value> {
        match &self.event_data {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

// ── Event subscriptions ─────────────────────────────────────────────────────

/// Event subscription bitmask sent in Identify/Reidentify.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSubscription(u32);

impl EventSubscription {
    pub const NONE: Self = Self(0);
    pub const GENERAL: Self = Self(1 << 0);
    pub const CONFIG: Self = Self(1 << 1);
    pub const SCENES: Self = Self(1 << 2);
    pub const INPUTS: Self = Self(1 << 3);
    pub const TRANSITIONS: Self = Self(1 << 4);
    pub const FILTERS: Self = Self(1 << 5);
    pub const OUTPUTS: Self = Self(1 << 6);
    pub const SCENE_ITEMS: Self = Self(1 << 7);
    pub const MEDIA_INPUTS: Self = Self(1 << 8);
    pub const VENDORS: Self = Self(1 << 9);
    pub const UI: Self = Self(1 << 10);

    pub const FLAGS: [Self; 11] = [
        Self::GENERAL,
        Self::CONFIG,
        Self::SCENES,
        Self::INPUTS,
        Self::TRANSITIONS,
        Self::FILTERS,
        Self::OUTPUTS,
        Self::SCENE_ITEMS,
        Self::MEDIA_INPUTS,
        Self::VENDORS,
        Self::UI,
    ];

    pub const ALL: Self = Self(
        Self::GENERAL.0
            | Self::CONFIG.0
            | Self::SCENES.0
            | Self::INPUTS.0
            | Self::TRANSITIONS.0
            | Self::FILTERS.0
            | Self::OUTPUTS.0
            | Self::SCENE_ITEMS.0
            | Self::MEDIA_INPUTS.0
            | Self::VENDORS.0
            | Self::UI.0,
    );

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build a mask from raw bits, dropping bits outside the defined flags.
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventSubscription {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSubscription {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Subscription category an event name belongs to. Names that fit no
/// category are General.
pub fn classify_event(event_type: &str) -> EventSubscription {
    const CONFIG_PREFIXES: [&str; 4] = [
        "CurrentSceneCollection",
        "SceneCollection",
        "CurrentProfile",
        "Profile",
    ];
    const TRANSITION_PREFIXES: [&str; 2] = ["CurrentSceneTransition", "SceneTransition"];
    const SCENE_PREFIXES: [&str; 3] = ["CurrentProgramScene", "CurrentPreviewScene", "Scene"];
    const OUTPUT_EVENTS: [&str; 6] = [
        "StreamStateChanged",
        "RecordStateChanged",
        "RecordFileChanged",
        "ReplayBufferStateChanged",
        "ReplayBufferSaved",
        "VirtualcamStateChanged",
    ];

    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| event_type.starts_with(p));

    if starts(&CONFIG_PREFIXES) {
        EventSubscription::CONFIG
    } else if event_type.starts_with("SceneItem") {
        EventSubscription::SCENE_ITEMS
    } else if starts(&TRANSITION_PREFIXES) {
        EventSubscription::TRANSITIONS
    } else if starts(&SCENE_PREFIXES) {
        EventSubscription::SCENES
    } else if event_type.starts_with("MediaInput") {
        EventSubscription::MEDIA_INPUTS
    } else if event_type.starts_with("Input") {
        EventSubscription::INPUTS
    } else if event_type.starts_with("SourceFilter") {
        EventSubscription::FILTERS
    } else if OUTPUT_EVENTS.contains(&event_type) {
        EventSubscription::OUTPUTS
    } else if event_type.starts_with("Vendor") {
        EventSubscription::VENDORS
    } else if event_type == "StudioModeStateChanged" || event_type == "ScreenshotSaved" {
        EventSubscription::UI
    } else {
        EventSubscription::GENERAL
    }
}

/// Whether an event of this type is covered by `mask`.
pub fn matches_subscription(event_type: &str, mask: EventSubscription) -> bool {
    mask.intersects(classify_event(event_type))
}

// ── Close codes ─────────────────────────────────────────────────────────────

pub mod close_code {
    pub const UNKNOWN_REASON: u16 = 4000;
    pub const MESSAGE_DECODE_ERROR: u16 = 4002;
    pub const MISSING_DATA_FIELD: u16 = 4003;
    pub const INVALID_DATA_FIELD_TYPE: u16 = 4004;
    pub const INVALID_DATA_FIELD_VALUE: u16 = 4005;
    pub const UNKNOWN_OP_CODE: u16 = 4006;
    pub const NOT_IDENTIFIED: u16 = 4007;
    pub const ALREADY_IDENTIFIED: u16 = 4008;
    pub const AUTHENTICATION_FAILED: u16 = 4009;
    pub const UNSUPPORTED_RPC_VERSION: u16 = 4010;
    pub const SESSION_INVALIDATED: u16 = 4011;
    pub const UNSUPPORTED_FEATURE: u16 = 4012;
}

/// Close codes after which reconnecting would fail the same way again.
pub fn is_unrecoverable_close_code(code: u16) -> bool {
    matches!(
        code,
        close_code::AUTHENTICATION_FAILED
            | close_code::UNSUPPORTED_RPC_VERSION
            | close_code::UNSUPPORTED_FEATURE
    )
}

pub fn close_code_name(code: u16) -> &'static str {
    match code {
        1000 => "normal_closure",
        1001 => "going_away",
        1006 => "abnormal_closure",
        close_code::UNKNOWN_REASON => "unknown_reason",
        close_code::MESSAGE_DECODE_ERROR => "message_decode_error",
        close_code::MISSING_DATA_FIELD => "missing_data_field",
        close_code::INVALID_DATA_FIELD_TYPE => "invalid_data_field_type",
        close_code::INVALID_DATA_FIELD_VALUE => "invalid_data_field_value",
        close_code::UNKNOWN_OP_CODE => "unknown_op_code",
        close_code::NOT_IDENTIFIED => "not_identified",
        close_code::ALREADY_IDENTIFIED => "already_identified",
        close_code::AUTHENTICATION_FAILED => "authentication_failed",
        close_code::UNSUPPORTED_RPC_VERSION => "unsupported_rpc_version",
        close_code::SESSION_INVALIDATED => "session_invalidated",
        close_code::UNSUPPORTED_FEATURE => "unsupported_feature",
        _ => "other",
    }
}

// ── Request validation ──────────────────────────────────────────────────────

/// Check an untyped request before it is tracked. The name must be a string;
/// the payload is passed through as-is.
pub fn validate_request<'a>(name: &'a Value, _payload: &Value) -> Result<&'a str, ProtocolError> {
    name.as_str().ok_or(ProtocolError::InvalidRequestType)
}
