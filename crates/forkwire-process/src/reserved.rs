//! Reserved control-plane methods.
//!
//! Method names in the `__name__` namespace belong to the runtime; user
//! code must not register or call them. Payloads are plain serde structs
//! carried as the envelope's params/result.

use serde::{Deserialize, Serialize};

/// Manager -> worker, first request on every life. The response is the
/// worker's ready signal.
pub const HANDSHAKE: &str = "__handshake__";
/// Manager -> worker liveness probe (notification).
pub const HEARTBEAT_PING: &str = "__heartbeat_ping__";
/// Worker -> manager probe answer (notification).
pub const HEARTBEAT_PONG: &str = "__heartbeat_pong__";
/// Manager -> worker graceful-exit request.
pub const SHUTDOWN: &str = "__shutdown__";
/// Worker -> manager notification that it finished shutting down.
pub const SHUTDOWN_COMPLETE: &str = "__shutdown_complete__";
/// Worker -> manager notification that its data channel is connected.
pub const DATA_CHANNEL_READY: &str = "__data_channel_ready__";
/// Worker -> manager notification that the data channel failed.
pub const DATA_CHANNEL_ERROR: &str = "__data_channel_error__";

/// Protocol version advertised in the handshake.
pub const PROTOCOL_VERSION: &str = "1";

/// Whether `method` lives in the reserved namespace.
pub fn is_reserved_method(method: &str) -> bool {
    method.len() > 4 && method.starts_with("__") && method.ends_with("__")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeParams {
    pub version: String,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_channel: Option<DataChannelInfo>,
}

/// Where and how the worker should dial the data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChannelInfo {
    pub path: String,
    pub serialization: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPing {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPong {
    pub timestamp: u64,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadReport>,
}

/// Optional load metrics the worker reports on a pong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

/// Why a worker is being asked to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    UserRequested,
    ManagerShutdown,
    IdleTimeout,
    ErrorThreshold,
    Restart,
    HeartbeatDead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownParams {
    pub timeout_ms: u64,
    pub reason: ShutdownReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownAck {
    /// Always `"shutting_down"` from a compliant worker.
    pub status: String,
    #[serde(default)]
    pub pending_requests: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownCompleteParams {
    pub exit_code: i32,
}
