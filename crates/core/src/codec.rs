// Newline-delimited JSON framing for the peer channel

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// JSON-RPC version tag written on every outbound request.
pub const JSONRPC_VERSION: &str = "2.0";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a request id that is unique for the life of the process.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Request sent from the bridge to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl PeerRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A decoded frame, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// `method` without `id`.
    Notification { method: String, params: Value },
    /// Numeric `id` without `method`. `Err` holds the `error` member.
    Response {
        id: u64,
        outcome: Result<Value, Value>,
    },
    /// Anything that fits neither shape, or fits both.
    Unrecognized(Value),
}

impl InboundMessage {
    /// Classify a decoded JSON document.
    ///
    /// The classes are mutually exclusive: a message carrying both `method`
    /// and `id` is a peer-originated request, which this channel does not
    /// support, so it is reported as unrecognized rather than guessed at.
    pub fn classify(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::Unrecognized(value);
        };

        let has_id = object.contains_key("id");
        let has_method = object.contains_key("method");

        if has_method && !has_id {
            if let Some(method) = object.get("method").and_then(Value::as_str) {
                let params = object.get("params").cloned().unwrap_or(Value::Null);
                return Self::Notification {
                    method: method.to_string(),
                    params,
                };
            }
            return Self::Unrecognized(value);
        }

        if has_id && !has_method {
            if let Some(id) = object.get("id").and_then(Value::as_u64) {
                let outcome = match object.get("error") {
                    Some(error) if !error.is_null() => Err(error.clone()),
                    _ => Ok(object.get("result").cloned().unwrap_or(Value::Null)),
                };
                return Self::Response { id, outcome };
            }
        }

        Self::Unrecognized(value)
    }
}

/// Codec for the peer channel: decodes [`InboundMessage`]s, encodes
/// [`PeerRequest`]s.
#[derive(Debug, Default)]
pub struct FrameCodec {
    // Bytes already scanned for a newline, so partial lines are not rescanned.
    next_index: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = InboundMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<InboundMessage>, io::Error> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = src.len();
                return Ok(None);
            };

            let newline = self.next_index + offset;
            self.next_index = 0;
            let frame = src.split_to(newline + 1);

            let text = match std::str::from_utf8(&frame[..newline]) {
                Ok(text) => text.trim(),
                Err(e) => {
                    warn!(error = %e, "Discarding frame that is not valid UTF-8");
                    continue;
                }
            };
            if text.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(text) {
                Ok(value) => return Ok(Some(InboundMessage::classify(value))),
                Err(e) => {
                    let preview: String = text.chars().take(200).collect();
                    warn!(error = %e, line = %preview, "Discarding malformed frame");
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<InboundMessage>, io::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "Dropping unterminated frame at end of stream");
            src.clear();
            self.next_index = 0;
        }
        Ok(None)
    }
}

impl Encoder<&PeerRequest> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, request: &PeerRequest, dst: &mut BytesMut) -> Result<(), io::Error> {
        let encoded = serde_json::to_vec(request)?;
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }
}
