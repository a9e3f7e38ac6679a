// sb-protocol: Wire-level envelope types and serialization.
//
// Every protocol adapter parses its wire format into an `Envelope` and
// encodes replies back out of one.  All JSON-carrying transports use a
// top-level `type` field for discriminated frame kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod error;
pub mod jsonrpc;

pub use error::{ErrorCategory, ErrorCode, FieldError, RpcError};
pub use jsonrpc::{JsonRpcError, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse};

// ---------------------------------------------------------------------------
// Frame kinds
// ---------------------------------------------------------------------------

/// Every message kind that can appear on a wire, tagged by the `type` field.
///
/// Request/response/event/ack/error plus stream framing and the channel
/// (pub/sub) frames carried over WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "event")]
    Event,
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "stream:start")]
    StreamStart,
    #[serde(rename = "stream:data")]
    StreamData,
    #[serde(rename = "stream:end")]
    StreamEnd,
    #[serde(rename = "stream:error")]
    StreamError,
    #[serde(rename = "subscribe")]
    Subscribe,
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    #[serde(rename = "publish")]
    Publish,
    #[serde(rename = "subscribed")]
    Subscribed,
    #[serde(rename = "unsubscribed")]
    Unsubscribed,
    #[serde(rename = "presence:join")]
    PresenceJoin,
    #[serde(rename = "presence:leave")]
    PresenceLeave,
}

impl FrameKind {
    /// The exact wire string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Request => "request",
            FrameKind::Response => "response",
            FrameKind::Event => "event",
            FrameKind::Ack => "ack",
            FrameKind::Error => "error",
            FrameKind::StreamStart => "stream:start",
            FrameKind::StreamData => "stream:data",
            FrameKind::StreamEnd => "stream:end",
            FrameKind::StreamError => "stream:error",
            FrameKind::Subscribe => "subscribe",
            FrameKind::Unsubscribe => "unsubscribe",
            FrameKind::Publish => "publish",
            FrameKind::Subscribed => "subscribed",
            FrameKind::Unsubscribed => "unsubscribed",
            FrameKind::PresenceJoin => "presence:join",
            FrameKind::PresenceLeave => "presence:leave",
        }
    }

    /// True for the stream sub-kinds (`stream:*`).
    pub fn is_stream_frame(self) -> bool {
        matches!(
            self,
            FrameKind::StreamStart
                | FrameKind::StreamData
                | FrameKind::StreamEnd
                | FrameKind::StreamError
        )
    }

    /// True for the frames handled by the channel manager rather than the router.
    pub fn is_channel_frame(self) -> bool {
        matches!(
            self,
            FrameKind::Subscribe | FrameKind::Unsubscribe | FrameKind::Publish
        )
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The canonical in-flight message.
///
/// Immutable once produced; replies are constructed fresh via the
/// `response_to` / `error_to` / stream-frame constructors so the correlation
/// id rules live in one place:
///
/// - procedure responses reuse the request id unchanged
/// - error replies suffix `:error`
/// - acks suffix `:ack`
/// - stream frames share the initiating id unchanged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    /// Dotted handler name; empty for internal frames (ack, channel frames).
    #[serde(default)]
    pub procedure: String,
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default)]
    pub payload: Value,
    /// Flat string map: headers, auth tokens, trace ids.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Channel name, for channel frames only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event name, for publish / presence frames only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl Envelope {
    /// A fresh request envelope with a random id.
    pub fn request(procedure: impl Into<String>, payload: Value) -> Self {
        Self::request_with_id(uuid::Uuid::new_v4().to_string(), procedure, payload)
    }

    pub fn request_with_id(
        id: impl Into<String>,
        procedure: impl Into<String>,
        payload: Value,
    ) -> Self {
        Envelope {
            id: id.into(),
            procedure: procedure.into(),
            kind: FrameKind::Request,
            payload,
            metadata: BTreeMap::new(),
            channel: None,
            event: None,
        }
    }

    /// A fire-and-forget event envelope.
    pub fn event(procedure: impl Into<String>, payload: Value) -> Self {
        Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            procedure: procedure.into(),
            kind: FrameKind::Event,
            payload,
            metadata: BTreeMap::new(),
            channel: None,
            event: None,
        }
    }

    /// A stream-start request envelope (client side of a stream invocation).
    pub fn stream_request(procedure: impl Into<String>, payload: Value) -> Self {
        Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            procedure: procedure.into(),
            kind: FrameKind::StreamStart,
            payload,
            metadata: BTreeMap::new(),
            channel: None,
            event: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The single-response reply to a request envelope.
    pub fn response_to(request: &Envelope, payload: Value) -> Self {
        Envelope {
            id: request.id.clone(),
            procedure: request.procedure.clone(),
            kind: FrameKind::Response,
            payload,
            metadata: BTreeMap::new(),
            channel: None,
            event: None,
        }
    }

    /// The error reply to any envelope; id gains the `:error` suffix.
    pub fn error_to(request: &Envelope, err: &RpcError) -> Self {
        Envelope {
            id: error_id(&request.id),
            procedure: request.procedure.clone(),
            kind: FrameKind::Error,
            payload: serde_json::to_value(err).unwrap_or(Value::Null),
            metadata: BTreeMap::new(),
            channel: None,
            event: None,
        }
    }

    /// A free-standing error envelope for failures with no parseable request
    /// (e.g. a malformed frame where not even the id could be recovered).
    pub fn error_frame(id: impl Into<String>, err: &RpcError) -> Self {
        Envelope {
            id: id.into(),
            procedure: String::new(),
            kind: FrameKind::Error,
            payload: serde_json::to_value(err).unwrap_or(Value::Null),
            metadata: BTreeMap::new(),
            channel: None,
            event: None,
        }
    }

    /// The ack reply to an envelope; id gains the `:ack` suffix.
    pub fn ack_to(request: &Envelope) -> Self {
        Envelope {
            id: ack_id(&request.id),
            procedure: String::new(),
            kind: FrameKind::Ack,
            payload: Value::Null,
            metadata: BTreeMap::new(),
            channel: None,
            event: None,
        }
    }

    fn stream_frame(origin_id: &str, kind: FrameKind, payload: Value) -> Self {
        Envelope {
            id: origin_id.to_owned(),
            procedure: String::new(),
            kind,
            payload,
            metadata: BTreeMap::new(),
            channel: None,
            event: None,
        }
    }

    pub fn stream_start(origin_id: &str) -> Self {
        Self::stream_frame(origin_id, FrameKind::StreamStart, Value::Null)
    }

    pub fn stream_data(origin_id: &str, payload: Value) -> Self {
        Self::stream_frame(origin_id, FrameKind::StreamData, payload)
    }

    pub fn stream_end(origin_id: &str) -> Self {
        Self::stream_frame(origin_id, FrameKind::StreamEnd, Value::Null)
    }

    pub fn stream_error(origin_id: &str, err: &RpcError) -> Self {
        Self::stream_frame(
            origin_id,
            FrameKind::StreamError,
            serde_json::to_value(err).unwrap_or(Value::Null),
        )
    }

    /// Decode one envelope from wire JSON.
    ///
    /// Distinguishes the two §parse failure classes: malformed JSON is
    /// `PARSE_ERROR`; well-formed JSON missing a required envelope field
    /// (`id`, `type`) or with an unrecognized `type` is `INVALID_ENVELOPE`.
    pub fn from_json_str(raw: &str) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| RpcError::new(ErrorCode::ParseError, format!("malformed JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_json_bytes(raw: &[u8]) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| RpcError::new(ErrorCode::ParseError, format!("malformed JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        let obj = value.as_object().ok_or_else(|| {
            RpcError::new(ErrorCode::InvalidEnvelope, "envelope must be a JSON object")
        })?;
        if !obj.get("id").is_some_and(|v| v.is_string()) {
            return Err(RpcError::new(
                ErrorCode::InvalidEnvelope,
                "missing required field: id",
            ));
        }
        if !obj.get("type").is_some_and(|v| v.is_string()) {
            return Err(RpcError::new(
                ErrorCode::InvalidEnvelope,
                "missing required field: type",
            ));
        }
        serde_json::from_value(value).map_err(|e| {
            RpcError::new(ErrorCode::InvalidEnvelope, format!("invalid envelope: {e}"))
        })
    }

    pub fn to_json(&self) -> String {
        // Envelope serialization cannot fail: all fields are JSON-native.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The error payload carried by an `error` or `stream:error` frame,
    /// if this envelope is one.
    pub fn as_error(&self) -> Option<RpcError> {
        if matches!(self.kind, FrameKind::Error | FrameKind::StreamError) {
            serde_json::from_value(self.payload.clone()).ok()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Correlation-id suffix rules
// ---------------------------------------------------------------------------

pub fn error_id(origin: &str) -> String {
    format!("{origin}:error")
}

pub fn ack_id(origin: &str) -> String {
    format!("{origin}:ack")
}

/// Strip an `:ack` suffix, returning the originating id.  Used by UDP
/// send-with-retry clients to correlate acks with pending sends.
pub fn strip_ack_suffix(id: &str) -> Option<&str> {
    id.strip_suffix(":ack")
}
