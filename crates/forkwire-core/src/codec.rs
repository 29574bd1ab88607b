use bytes::Bytes;
use serde_json::Value;

use crate::ChannelError;

/// Value <-> bytes seam consumed by the channel engine.
///
/// Concrete codecs must round-trip every value the application uses as
/// params, results, or notification payloads. The identifier pair
/// (`name`, `content_type`) is advertised during the process handshake so
/// both sides agree on the data-channel encoding.
pub trait Serializer: Send + Sync {
    fn name(&self) -> &'static str;

    fn content_type(&self) -> &'static str;

    fn serialize(&self, value: &Value) -> Result<Bytes, ChannelError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, ChannelError>;
}

/// JSON codec, the default for the control channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize(&self, value: &Value) -> Result<Bytes, ChannelError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Bytes::from(bytes))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, ChannelError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
