use serde::{Deserialize, Serialize};

use super::{Request, Response};
use crate::error::LimitdError;

/// Inbound frame: a request plus a caller-chosen correlation id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    /// Echoed back in the reply; any JSON value.
    #[serde(default)]
    pub id: serde_json::Value,
    /// The request itself, flattened into the frame.
    #[serde(flatten)]
    pub request: Request,
}

/// Structured failure payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Stable machine-readable kind (see [`LimitdError::kind`]).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&LimitdError> for ErrorBody {
    fn from(err: &LimitdError) -> Self {
        Self { kind: err.kind().to_string(), message: err.to_string() }
    }
}

/// Outbound frame: exactly one of `ok` / `error` is set.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplyFrame {
    /// Correlation id from the request (null if it could not be parsed).
    pub id: serde_json::Value,
    /// Successful response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<Response>,
    /// Failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ReplyFrame {
    /// Build a reply from a handler result.
    pub fn from_result(id: serde_json::Value, result: Result<Response, LimitdError>) -> Self {
        match result {
            Ok(response) => Self { id, ok: Some(response), error: None },
            Err(err) => Self { id, ok: None, error: Some(ErrorBody::from(&err)) },
        }
    }

    /// Reply to a frame that could not be decoded.
    pub fn malformed(err: &CodecError) -> Self {
        Self {
            id: serde_json::Value::Null,
            ok: None,
            error: Some(ErrorBody { kind: "malformed_request".into(), message: err.to_string() }),
        }
    }
}

/// Frame codec failures.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The frame was not a valid request.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Codec abstraction for mapping raw frames to requests and replies.
///
/// Transports (TCP lines, message queues, in-process channels) all map to these
/// frames before reaching the service.
pub trait FrameCodec: Send + Sync {
    /// Decode one raw frame.
    fn decode(&self, raw: &[u8]) -> Result<RequestFrame, CodecError>;

    /// Encode one reply, without a trailing delimiter.
    fn encode(&self, reply: &ReplyFrame) -> Vec<u8>;
}

/// One JSON object per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLines;

impl FrameCodec for JsonLines {
    fn decode(&self, raw: &[u8]) -> Result<RequestFrame, CodecError> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn encode(&self, reply: &ReplyFrame) -> Vec<u8> {
        // Serializing plain data structs to a Vec cannot fail.
        serde_json::to_vec(reply).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_flattened_request_with_id() {
        let frame = JsonLines
            .decode(br#"{"id":7,"method":"WAIT","type":"ip","instance":"a","count":3}
"#)
            .unwrap();
        assert_eq!(frame.id, json!(7));
        assert_eq!(
            frame.request,
            Request::Wait { bucket: "ip".into(), instance: "a".into(), count: 3 }
        );
    }

    #[test]
    fn missing_id_is_null() {
        let frame = JsonLines.decode(br#"{"method":"STATUS","type":"ip","instance":"c"}"#).unwrap();
        assert_eq!(frame.id, serde_json::Value::Null);
    }

    #[test]
    fn error_reply_carries_kind_and_message() {
        let err = LimitdError::UnknownBucketType { name: "blabla".into() };
        let reply = ReplyFrame::from_result(json!("r1"), Err(err));
        let wire: serde_json::Value = serde_json::from_slice(&JsonLines.encode(&reply)).unwrap();
        assert_eq!(
            wire,
            json!({ "id": "r1", "error": { "kind": "unknown_bucket_type", "message": "blabla is not a valid bucket type" } })
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let err = JsonLines.decode(b"not json").unwrap_err();
        let reply = ReplyFrame::malformed(&err);
        assert_eq!(reply.error.unwrap().kind, "malformed_request");
    }
}
