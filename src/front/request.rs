use serde::{Deserialize, Serialize};

use crate::bucket::{PutResponse, StatusResponse, TakeResponse};

fn one() -> u64 {
    1
}

/// A request addressed to one bucket type.
///
/// On the wire the method is carried in a `method` field:
/// `{"method":"TAKE","type":"ip","instance":"1.2.3.4","count":1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "UPPERCASE")]
pub enum Request {
    /// Consume tokens now or report non-conformance.
    Take {
        /// Bucket type.
        #[serde(rename = "type")]
        bucket: String,
        /// Instance id.
        instance: String,
        /// Tokens to consume.
        #[serde(default = "one")]
        count: u64,
    },
    /// Consume tokens, holding the reply until they exist (bounded by max wait).
    Wait {
        /// Bucket type.
        #[serde(rename = "type")]
        bucket: String,
        /// Instance id.
        instance: String,
        /// Tokens to consume.
        #[serde(default = "one")]
        count: u64,
    },
    /// Refill tokens; a missing `tokens` restores the bucket to full.
    Put {
        /// Bucket type.
        #[serde(rename = "type")]
        bucket: String,
        /// Instance id.
        instance: String,
        /// Tokens to add.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
    },
    /// Live state of every instance whose id starts with `instance`.
    Status {
        /// Bucket type.
        #[serde(rename = "type")]
        bucket: String,
        /// Instance id or prefix.
        instance: String,
    },
}

impl Request {
    /// Method label (`TAKE`, `WAIT`, `PUT`, `STATUS`).
    pub fn method(&self) -> &'static str {
        match self {
            Request::Take { .. } => "TAKE",
            Request::Wait { .. } => "WAIT",
            Request::Put { .. } => "PUT",
            Request::Status { .. } => "STATUS",
        }
    }

    /// Bucket type the request addresses.
    pub fn bucket(&self) -> &str {
        match self {
            Request::Take { bucket, .. }
            | Request::Wait { bucket, .. }
            | Request::Put { bucket, .. }
            | Request::Status { bucket, .. } => bucket,
        }
    }

    /// Instance id (or STATUS prefix).
    pub fn instance(&self) -> &str {
        match self {
            Request::Take { instance, .. }
            | Request::Wait { instance, .. }
            | Request::Put { instance, .. }
            | Request::Status { instance, .. } => instance,
        }
    }
}

/// Reply to a WAIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResponse {
    /// Whether the tokens were granted.
    pub conformant: bool,
    /// Whether the reply was held back before granting.
    pub delayed: bool,
    /// Tokens left.
    pub remaining: u64,
    /// Bucket size.
    pub limit: u64,
    /// UNIX second at which the bucket is full again.
    pub reset: u64,
}

impl WaitResponse {
    pub(crate) fn from_take(take: TakeResponse, delayed: bool) -> Self {
        Self {
            conformant: take.conformant,
            delayed,
            remaining: take.remaining,
            limit: take.limit,
            reset: take.reset,
        }
    }
}

/// Reply to any [`Request`].
///
/// Untagged on the wire; variants are ordered so decoding picks the most
/// specific shape first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Wait(WaitResponse),
    Take(TakeResponse),
    Put(PutResponse),
    Status(StatusResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_defaults_to_one() {
        let req: Request =
            serde_json::from_str(r#"{"method":"TAKE","type":"ip","instance":"1.2.3.4"}"#).unwrap();
        assert_eq!(
            req,
            Request::Take { bucket: "ip".into(), instance: "1.2.3.4".into(), count: 1 }
        );
        assert_eq!(req.method(), "TAKE");
        assert_eq!(req.bucket(), "ip");
    }

    #[test]
    fn put_without_tokens_is_a_full_reset() {
        let req: Request =
            serde_json::from_str(r#"{"method":"PUT","type":"ip","instance":"a"}"#).unwrap();
        assert!(matches!(req, Request::Put { tokens: None, .. }));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let res = serde_json::from_str::<Request>(r#"{"method":"PING","type":"ip","instance":"a"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn take_response_hides_delay() {
        let json = serde_json::to_value(Response::Take(TakeResponse {
            conformant: false,
            remaining: 0,
            limit: 10,
            reset: 7,
            delay: Some(std::time::Duration::from_millis(5)),
        }))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "conformant": false, "remaining": 0, "limit": 10, "reset": 7 })
        );
    }
}
