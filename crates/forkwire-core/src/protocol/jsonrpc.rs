//! JSON-RPC 2.0 envelope.

use serde_json::{Value, json};

use super::{
    ChannelMessage, ErrorObject, MessageId, Protocol, ResponseAccessor, error_object_from_value,
};

const VERSION: &str = "2.0";

/// The `"jsonrpc": "2.0"` envelope shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcProtocol;

impl Protocol for JsonRpcProtocol {
    fn id(&self) -> &'static str {
        "jsonrpc"
    }

    fn create_request(&self, method: &str, params: Option<Value>, id: &MessageId) -> Value {
        let mut envelope = json!({
            "jsonrpc": VERSION,
            "method": method,
            "id": id.to_value(),
        });
        if let Some(params) = params {
            envelope["params"] = params;
        }
        envelope
    }

    fn create_response(&self, id: &MessageId, result: Value) -> Value {
        json!({
            "jsonrpc": VERSION,
            "id": id.to_value(),
            "result": result,
        })
    }

    fn create_error_response(&self, id: &MessageId, error: &ErrorObject) -> Value {
        let mut body = json!({
            "code": error.code,
            "message": error.message,
        });
        if let Some(data) = &error.data {
            body["data"] = data.clone();
        }
        json!({
            "jsonrpc": VERSION,
            "id": id.to_value(),
            "error": body,
        })
    }

    fn create_notification(&self, method: &str, params: Option<Value>) -> Value {
        let mut envelope = json!({
            "jsonrpc": VERSION,
            "method": method,
        });
        if let Some(params) = params {
            envelope["params"] = params;
        }
        envelope
    }

    fn parse_message(&self, value: &Value) -> ChannelMessage {
        let Some(obj) = value.as_object() else {
            return ChannelMessage::Invalid {
                reason: "envelope is not an object".into(),
            };
        };
        if obj.get("jsonrpc").and_then(Value::as_str) != Some(VERSION) {
            return ChannelMessage::Invalid {
                reason: "missing or unsupported jsonrpc version".into(),
            };
        }

        let method = obj.get("method").and_then(Value::as_str);
        let has_id = obj.contains_key("id");

        match (method, has_id) {
            (Some(method), true) => {
                let Some(id) = obj.get("id").and_then(MessageId::from_value) else {
                    return ChannelMessage::Invalid {
                        reason: "request id must be a string or an integer".into(),
                    };
                };
                ChannelMessage::Request {
                    id,
                    method: method.to_owned(),
                    params: obj.get("params").cloned(),
                }
            }
            (Some(method), false) => ChannelMessage::Notification {
                method: method.to_owned(),
                params: obj.get("params").cloned(),
            },
            (None, true) if obj.contains_key("result") || obj.contains_key("error") => {
                ChannelMessage::Response { raw: value.clone() }
            }
            _ => ChannelMessage::Invalid {
                reason: "envelope is neither request, response, nor notification".into(),
            },
        }
    }
}

/// Field access for JSON-RPC responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcAccessor;

impl ResponseAccessor for JsonRpcAccessor {
    fn id(&self, response: &Value) -> Option<MessageId> {
        response.get("id").and_then(MessageId::from_value)
    }

    fn is_error(&self, response: &Value) -> bool {
        response.get("error").is_some()
    }

    fn result(&self, response: &Value) -> Option<Value> {
        response.get("result").cloned()
    }

    fn error(&self, response: &Value) -> Option<ErrorObject> {
        response.get("error").and_then(error_object_from_value)
    }
}
