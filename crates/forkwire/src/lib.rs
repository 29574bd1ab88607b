//! Local IPC runtime for parent/child process coordination.
//!
//! A manager spawns worker processes and talks to each over two channels: a
//! low-latency control channel on the child's stdio (structured envelopes,
//! JSON-RPC by default) and an optional high-throughput binary data channel
//! over a local socket.
//!
//! ```no_run
//! use forkwire::prelude::*;
//!
//! # async fn demo() -> Result<(), forkwire::ProcessError> {
//! let manager = ProcessManager::new();
//! let options = SpawnOptions::new(CommandSpec::new("my-worker"));
//! let worker = manager.spawn("render-1", options).await?;
//!
//! let area = worker
//!     .request("area", Some(serde_json::json!({"w": 3, "h": 4})), None)
//!     .await?;
//! assert_eq!(area["sqm"], 12);
//!
//! manager.terminate("render-1", ShutdownReason::UserRequested).await?;
//! # Ok(())
//! # }
//! ```

// Channel stack
pub use forkwire_core::{
    BoxError,
    Channel,
    ChannelError,
    ChannelEvent,
    ChannelOptions,
    CommandSpec,
    EventHub,
    // Framing
    FramingCodec,
    IncomingRequest,
    JsonRpcAccessor,
    // Protocols
    JsonRpcProtocol,
    JsonSerializer,
    MessageId,
    MetricsEvent,
    MetricsSink,
    // Observation
    Middleware,
    Protocol,
    ResponseAccessor,
    // Serialization
    Serializer,
    SimpleProtocol,
    SocketServer,
    Subscription,
    // Transports
    Transport,
    TransportEvent,
    TransportState,
    // Endpoints
    cleanup_endpoint,
    endpoint_path,
};
pub use forkwire_core::{
    CODE_INTERNAL_ERROR, CODE_METHOD_NOT_FOUND, ErrorObject, SocketTransport, StdioTransport,
};

// Supervision
pub use forkwire_process::{
    DataChannel, DataChannelConfig, DataOptions, DataRole, ForceReason, HeartbeatOptions,
    ProcessError, ProcessEvent, ProcessHandle, ProcessManager, ProcessState, ReconnectEvent,
    ReconnectManager, ReconnectOptions, ReconnectState, Reconnectable, RestartPolicy,
    ShutdownEvent, ShutdownManager, ShutdownOptions, ShutdownOutcome, ShutdownReason,
    SpawnOptions, reserved,
};

// Binary wire format
pub use forkwire_wire::{Frame, FrameFlags, FrameHeader, Reassembler, StreamSink, WireError};

/// Convenient imports for typical manager-side code.
pub mod prelude {
    pub use crate::{
        Channel, ChannelError, ChannelOptions, CommandSpec, ProcessEvent, ProcessHandle,
        ProcessManager, ShutdownReason, SpawnOptions, Transport,
    };
}
