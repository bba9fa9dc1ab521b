// packages/engine/src/rpc/messages.rs
//! Wire frames and façade bodies
//!
//! Two families live here:
//!
//! - Protobuf frames crossing shared memory between the front-end and
//!   workers (arguments and structured returns). These stay `prost`
//!   messages so payload bytes travel untouched.
//! - JSON bodies of the HTTP façade. Opaque byte fields are base64 in
//!   transit.

use crate::utils::errors::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost::Message;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Worker argument / return frames (shared-memory side)
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct CreateAgentArgs {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub agent_init_args: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub agent_source_code: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AgentArgs {
    #[prost(string, tag = "1")]
    pub agent_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ModelConfigsArgs {
    #[prost(string, tag = "1")]
    pub model_configs: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReplyArgs {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub message: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub task_id: u64,
    #[prost(int32, tag = "4")]
    pub callback_id: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ObserveArgs {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub message: Vec<u8>,
}

/// Structured return of a finished `reply` task
#[derive(Clone, PartialEq, Message)]
pub struct ReplyReturn {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub message: Vec<u8>,
}

/// Structured return of `get_agent_memory`
#[derive(Clone, PartialEq, Message)]
pub struct AgentMemoryReturn {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(bytes = "vec", tag = "2")]
    pub memory: Vec<u8>,
}

/// Encode a frame for the shared-memory channel
pub fn encode_frame<M: Message>(frame: &M) -> Vec<u8> {
    frame.encode_to_vec()
}

/// Decode a frame read from the shared-memory channel
pub fn decode_frame<M: Message + Default>(bytes: &[u8]) -> Result<M> {
    Ok(M::decode(bytes)?)
}

// ---------------------------------------------------------------------------
// Placeholder message
// ---------------------------------------------------------------------------

/// The message handed back by `reply` before the work completes; the
/// task id inside is the handle for `update_placeholder`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPlaceholder {
    pub task_id: u64,
    pub agent_id: String,
}

impl TaskPlaceholder {
    pub fn to_json(&self) -> String {
        // Serialization of two scalar fields cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

// ---------------------------------------------------------------------------
// HTTP façade bodies
// ---------------------------------------------------------------------------

/// Uniform response body of every non-streaming service method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralResponse {
    pub ok: bool,
    pub message: String,
}

impl GeneralResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    pub agent_id: String,
    /// base64-encoded opaque init settings
    #[serde(default)]
    pub agent_init_args: String,
    /// base64-encoded opaque source payload
    #[serde(default)]
    pub agent_source_code: String,
}

/// Single-string request (`delete_agent`, `clone_agent`, …)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringMsg {
    pub value: String,
}

/// Request of `call_agent_func`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMsg {
    pub agent_id: String,
    pub target_func: String,
    /// base64-encoded opaque message payload
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePlaceholderRequest {
    pub task_id: u64,
}

/// Decode a base64 body field; empty input means an absent payload
pub fn decode_bytes_field(field: &str) -> std::result::Result<Vec<u8>, String> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    BASE64
        .decode(field)
        .map_err(|e| format!("invalid base64 payload: {}", e))
}

/// Encode an opaque payload for a JSON body
pub fn encode_bytes_field(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_args_roundtrip() {
        let args = ReplyArgs {
            agent_id: "a".into(),
            message: vec![0, 159, 146, 150], // not valid UTF-8 on purpose
            task_id: 42,
            callback_id: 7,
        };
        let decoded: ReplyArgs = decode_frame(&encode_frame(&args)).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_frame::<ReplyReturn>(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_placeholder_json_shape() {
        let placeholder = TaskPlaceholder {
            task_id: 3,
            agent_id: "alice".into(),
        };
        let json = placeholder.to_json();
        assert!(json.contains("\"task_id\":3"));
        assert_eq!(TaskPlaceholder::from_json(&json).unwrap(), placeholder);
        assert!(TaskPlaceholder::from_json("not json").is_none());
    }

    #[test]
    fn test_bytes_field_roundtrip() {
        let bytes = vec![1u8, 2, 254, 255];
        let encoded = encode_bytes_field(&bytes);
        assert_eq!(decode_bytes_field(&encoded).unwrap(), bytes);
        assert_eq!(decode_bytes_field("").unwrap(), Vec::<u8>::new());
        assert!(decode_bytes_field("!!!").is_err());
    }
}
