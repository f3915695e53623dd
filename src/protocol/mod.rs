//! Line-framed JSON-RPC 2.0 message model.
//!
//! The agent protocol is newline-delimited JSON where each line is one of
//! three shapes, discriminated by field presence rather than a tag:
//!
//! | Fields present          | Message        |
//! |-------------------------|----------------|
//! | `id` + `method`         | [`Message::Request`]      |
//! | `id` + `result`/`error` | [`Message::Response`]     |
//! | `method` without `id`   | [`Message::Notification`] |
//!
//! IDs are opaque: an integer id and a string id are never considered
//! interchangeable, so [`RpcId`] preserves the original JSON type.
//!
//! Inbound framing is handled by [`FrameCodec`]; outbound frames are
//! serialised with [`Message::encode_line`] and written directly, so no
//! encoder half exists.

use std::fmt::{Display, Formatter};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

// ── Inbound framing ───────────────────────────────────────────────────────────

/// Decode-only NDJSON framing for the agent's stdout.
///
/// Line-splitting is delegated to [`LinesCodec`]; the codec's own job is the
/// frame bound and the error taxonomy. The bound comes from the gateway's
/// `max_frame_bytes` option, so a misbehaving agent cannot force unbounded
/// buffering by withholding the `\n` delimiter. An oversized frame surfaces
/// as [`AppError::Protocol`] — the reader logs it and keeps the stream —
/// while genuine I/O failures surface as [`AppError::Io`] and stop it.
#[derive(Debug)]
pub struct FrameCodec {
    lines: LinesCodec,
}

impl FrameCodec {
    /// Build a codec that rejects frames longer than `max_frame_bytes`.
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_bytes),
        }
    }

    fn map_error(&self, e: LinesCodecError) -> AppError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
                "frame exceeds {} bytes",
                self.lines.max_length()
            )),
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    /// Yield the next complete frame, or `Ok(None)` while buffering.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.lines.decode(src).map_err(|e| self.map_error(e))
    }

    /// Yield the final unterminated frame at EOF, if any.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.lines.decode_eof(src).map_err(|e| self.map_error(e))
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// JSON-RPC request/response correlation id.
///
/// Kept as the original JSON type — `7` and `"7"` are distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Integer id (the gateway's own outgoing requests use these).
    Num(i64),
    /// String id.
    Str(String),
}

impl Display for RpcId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        Self::Num(n)
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

/// JSON-RPC error object carried in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

/// One line-framed JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request expecting a correlated response.
    Request {
        /// Correlation id the response must echo.
        id: RpcId,
        /// Method name.
        method: String,
        /// Method parameters.
        params: Option<Value>,
    },
    /// A response to an earlier request.
    Response {
        /// Correlation id of the originating request.
        id: RpcId,
        /// Success payload; absent when `error` is set.
        result: Option<Value>,
        /// Error payload; wins over `result` when both are present.
        error: Option<RpcError>,
    },
    /// A fire-and-forget notification.
    Notification {
        /// Method name.
        method: String,
        /// Method parameters.
        params: Option<Value>,
    },
}

impl Message {
    /// Parse one decoded line into a [`Message`].
    ///
    /// Discrimination is by field shape; see the module docs. A response
    /// carrying both `result` and `error` is accepted and the error wins at
    /// dispatch time.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`]`("malformed json: …")` — the line is not a
    ///   JSON object.
    /// - [`AppError::Protocol`]`("unclassifiable message: …")` — the object
    ///   matches none of the three shapes.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| AppError::Protocol(format!("malformed json: {e}")))?;

        let Value::Object(ref obj) = value else {
            return Err(AppError::Protocol(format!(
                "malformed json: expected object, got {value}"
            )));
        };

        let id = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(parse_id(raw)?),
        };
        let method = obj.get("method").and_then(Value::as_str);

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request {
                id,
                method: method.to_owned(),
                params: obj.get("params").cloned(),
            }),
            (Some(id), None) => {
                let result = obj.get("result").cloned();
                let error = match obj.get("error") {
                    None | Some(Value::Null) => None,
                    Some(raw) => Some(parse_error(raw)),
                };
                if result.is_none() && error.is_none() {
                    return Err(AppError::Protocol(
                        "unclassifiable message: id without method, result, or error".into(),
                    ));
                }
                Ok(Self::Response { id, result, error })
            }
            (None, Some(method)) => Ok(Self::Notification {
                method: method.to_owned(),
                params: obj.get("params").cloned(),
            }),
            (None, None) => Err(AppError::Protocol(
                "unclassifiable message: neither id nor method present".into(),
            )),
        }
    }

    /// Serialise this message to a compact single-line JSON string.
    ///
    /// The writer task appends the `\n` frame delimiter.
    #[must_use]
    pub fn encode_line(&self) -> String {
        let value = match self {
            Self::Request { id, method, params } => {
                let mut obj = serde_json::Map::new();
                obj.insert("id".into(), id_value(id));
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
                Value::Object(obj)
            }
            Self::Response { id, result, error } => {
                let mut obj = serde_json::Map::new();
                obj.insert("id".into(), id_value(id));
                match error {
                    // Exactly one of result/error appears on the wire.
                    Some(err) => {
                        obj.insert(
                            "error".into(),
                            serde_json::json!({ "code": err.code, "message": err.message }),
                        );
                    }
                    None => {
                        obj.insert("result".into(), result.clone().unwrap_or(Value::Null));
                    }
                }
                Value::Object(obj)
            }
            Self::Notification { method, params } => {
                let mut obj = serde_json::Map::new();
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
                Value::Object(obj)
            }
        };
        value.to_string()
    }
}

/// Parse the `id` field, preserving its JSON type.
fn parse_id(raw: &Value) -> Result<RpcId> {
    match raw {
        Value::Number(n) => n.as_i64().map(RpcId::Num).ok_or_else(|| {
            AppError::Protocol(format!("malformed id: non-integer number {n}"))
        }),
        Value::String(s) => Ok(RpcId::Str(s.clone())),
        other => Err(AppError::Protocol(format!(
            "malformed id: expected integer or string, got {other}"
        ))),
    }
}

/// Parse the `error` field of a response, tolerating missing subfields.
fn parse_error(raw: &Value) -> RpcError {
    let code = raw.get("code").and_then(Value::as_i64).unwrap_or(-1);
    let message = raw
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| raw.to_string(), str::to_owned);
    RpcError { code, message }
}

/// Render an [`RpcId`] back to its JSON form.
fn id_value(id: &RpcId) -> Value {
    match id {
        RpcId::Num(n) => Value::from(*n),
        RpcId::Str(s) => Value::String(s.clone()),
    }
}
