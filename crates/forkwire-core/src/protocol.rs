use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod jsonrpc;
mod simple;

pub use jsonrpc::{JsonRpcAccessor, JsonRpcProtocol};
pub use simple::{SimpleAccessor, SimpleProtocol};

/// Error code replied when no request handler is registered.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// Error code replied when a request handler fails.
pub const CODE_INTERNAL_ERROR: i64 = -32603;

/// Request/response correlation id. Integers are what the channel engine
/// assigns; strings are accepted from peers that prefer them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Int(u64),
    Str(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Str(id) => write!(f, "{id}"),
        }
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self::Int(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::Str(id.to_owned())
    }
}

impl MessageId {
    /// Parse an id out of an envelope field.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(id) => Value::from(*id),
            Self::Str(id) => Value::from(id.as_str()),
        }
    }
}

/// Error body of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Classified inbound envelope.
///
/// Responses keep their raw envelope: the channel pulls fields out of them
/// through a [`ResponseAccessor`] so custom envelope shapes stay opaque to
/// the engine.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Request {
        id: MessageId,
        method: String,
        params: Option<Value>,
    },
    Response {
        raw: Value,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Invalid {
        reason: String,
    },
}

impl ChannelMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }
}

/// Application-protocol seam: builds and classifies envelopes.
///
/// The channel engine never inspects envelope fields itself; everything
/// goes through these operations plus the response accessor.
pub trait Protocol: Send + Sync {
    /// Stable protocol identifier, used to pick a default accessor.
    fn id(&self) -> &'static str;

    fn create_request(&self, method: &str, params: Option<Value>, id: &MessageId) -> Value;

    fn create_response(&self, id: &MessageId, result: Value) -> Value;

    fn create_error_response(&self, id: &MessageId, error: &ErrorObject) -> Value;

    fn create_notification(&self, method: &str, params: Option<Value>) -> Value;

    fn parse_message(&self, value: &Value) -> ChannelMessage;
}

/// Uniform field access over a raw response envelope.
pub trait ResponseAccessor: Send + Sync {
    fn id(&self, response: &Value) -> Option<MessageId>;

    fn is_error(&self, response: &Value) -> bool;

    fn result(&self, response: &Value) -> Option<Value>;

    fn error(&self, response: &Value) -> Option<ErrorObject>;
}

/// Default accessor for a protocol identifier.
///
/// Returns the JSON-RPC accessor for `"jsonrpc"`, the simple accessor for
/// everything else (the simple envelope is the fallback shape).
pub fn default_accessor(protocol_id: &str) -> Arc<dyn ResponseAccessor> {
    match protocol_id {
        "jsonrpc" => Arc::new(JsonRpcAccessor),
        _ => Arc::new(SimpleAccessor),
    }
}

pub(crate) fn error_object_from_value(value: &Value) -> Option<ErrorObject> {
    let obj = value.as_object()?;
    Some(ErrorObject {
        code: obj.get("code")?.as_i64()?,
        message: obj.get("message")?.as_str()?.to_owned(),
        data: obj.get("data").cloned(),
    })
}
