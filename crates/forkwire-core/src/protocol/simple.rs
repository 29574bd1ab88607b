//! Tagged envelope with a `type` discriminator, lighter than JSON-RPC.

use serde_json::{Value, json};

use super::{
    ChannelMessage, ErrorObject, MessageId, Protocol, ResponseAccessor, error_object_from_value,
};

/// Envelope with `"type"` in `{"request", "response", "notification"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleProtocol;

impl Protocol for SimpleProtocol {
    fn id(&self) -> &'static str {
        "simple"
    }

    fn create_request(&self, method: &str, params: Option<Value>, id: &MessageId) -> Value {
        let mut envelope = json!({
            "type": "request",
            "id": id.to_value(),
            "method": method,
        });
        if let Some(params) = params {
            envelope["params"] = params;
        }
        envelope
    }

    fn create_response(&self, id: &MessageId, result: Value) -> Value {
        json!({
            "type": "response",
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
            "type": "response",
            "id": id.to_value(),
            "error": body,
        })
    }

    fn create_notification(&self, method: &str, params: Option<Value>) -> Value {
        let mut envelope = json!({
            "type": "notification",
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

        match obj.get("type").and_then(Value::as_str) {
            Some("request") => {
                let id = obj.get("id").and_then(MessageId::from_value);
                let method = obj.get("method").and_then(Value::as_str);
                match (id, method) {
                    (Some(id), Some(method)) => ChannelMessage::Request {
                        id,
                        method: method.to_owned(),
                        params: obj.get("params").cloned(),
                    },
                    _ => ChannelMessage::Invalid {
                        reason: "request requires id and method".into(),
                    },
                }
            }
            Some("response") => {
                if obj.contains_key("result") || obj.contains_key("error") {
                    ChannelMessage::Response { raw: value.clone() }
                } else {
                    ChannelMessage::Invalid {
                        reason: "response carries neither result nor error".into(),
                    }
                }
            }
            Some("notification") => match obj.get("method").and_then(Value::as_str) {
                Some(method) => ChannelMessage::Notification {
                    method: method.to_owned(),
                    params: obj.get("params").cloned(),
                },
                None => ChannelMessage::Invalid {
                    reason: "notification requires a method".into(),
                },
            },
            other => ChannelMessage::Invalid {
                reason: format!("unknown envelope type: {other:?}"),
            },
        }
    }
}

/// Field access for simple-envelope responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleAccessor;

impl ResponseAccessor for SimpleAccessor {
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
