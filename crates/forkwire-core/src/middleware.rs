use std::time::Duration;

use serde_json::Value;

use crate::ChannelError;

/// Boxed error returned by middleware hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Observation hooks around the channel's message flow.
///
/// All hooks default to no-ops. A failing hook never breaks the channel:
/// its error goes to the channel's diagnostic sink and processing
/// continues.
#[allow(unused_variables)]
pub trait Middleware: Send + Sync {
    /// A request envelope is about to be written.
    fn on_outgoing_request(&self, envelope: &Value) -> Result<(), BoxError> {
        Ok(())
    }

    /// A response envelope arrived for one of our requests.
    fn on_incoming_response(&self, envelope: &Value) -> Result<(), BoxError> {
        Ok(())
    }

    /// A request envelope arrived from the peer.
    fn on_incoming_request(&self, envelope: &Value) -> Result<(), BoxError> {
        Ok(())
    }

    /// A response envelope is about to be written.
    fn on_outgoing_response(&self, envelope: &Value) -> Result<(), BoxError> {
        Ok(())
    }

    /// The channel surfaced an error.
    fn on_error(&self, error: &ChannelError) -> Result<(), BoxError> {
        Ok(())
    }
}

/// One measured moment on the channel's hot path.
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    RequestStarted { method: String },
    RequestFinished { method: String, elapsed: Duration, ok: bool },
    NotificationSent { method: String },
    PayloadReceived { bytes: usize },
    Error { kind: &'static str },
}

/// Sink for [`MetricsEvent`]s. Implementations must be cheap; they run
/// inline on the channel's dispatch path.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricsEvent);
}
