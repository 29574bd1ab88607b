use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use forkwire_core::{Channel, EventHub, Subscription};

use crate::{DataChannel, ProcessError, ProcessEvent, is_reserved_method};

/// Lifecycle of one managed process.
///
/// Transitions are monotonic within one life; a restart begins a fresh life
/// at `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ProcessState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

/// User-facing façade over one child's channels.
///
/// The handle is a stable identity across restarts: its inner channels are
/// replaced on each life, so held clones keep working after a restart.
/// Handlers registered on the channels are dropped with each life; consumers
/// re-register on every `Ready` event.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: String,
    state: Mutex<ProcessState>,
    pid: Mutex<Option<u32>>,
    control: Mutex<Option<Channel>>,
    data: Mutex<Option<DataChannel>>,
    events: EventHub<ProcessEvent>,
}

impl ProcessHandle {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: id.to_owned(),
                state: Mutex::new(ProcessState::Starting),
                pid: Mutex::new(None),
                control: Mutex::new(None),
                data: Mutex::new(None),
                events: EventHub::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock()
    }

    /// Per-process events (mirrored onto the manager's bus).
    pub fn events(&self) -> &EventHub<ProcessEvent> {
        &self.inner.events
    }

    /// The current life's control channel.
    pub fn control_channel(&self) -> Option<Channel> {
        self.inner.control.lock().clone()
    }

    /// The current life's data channel, when one was configured.
    pub fn data_channel(&self) -> Option<DataChannel> {
        self.inner.data.lock().clone()
    }

    /// Request over the control channel.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ProcessError> {
        let channel = self.live_control(method)?;
        Ok(channel.request(method, params, timeout).await?)
    }

    /// Notification over the control channel.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProcessError> {
        let channel = self.live_control(method)?;
        Ok(channel.notify(method, params).await?)
    }

    /// Binary request over the data channel.
    pub async fn request_via_data(
        &self,
        method_id: u16,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes, ProcessError> {
        let data = self
            .data_channel()
            .ok_or_else(|| ProcessError::NoDataChannel(self.inner.id.clone()))?;
        Ok(data.request(method_id, payload, timeout).await?)
    }

    /// Subscribe to notifications from the worker on the current life.
    pub fn on_notification(
        &self,
        handler: impl Fn(&str, Option<&Value>) + Send + Sync + 'static,
    ) -> Result<Subscription, ProcessError> {
        let channel = self
            .control_channel()
            .ok_or_else(|| self.not_running())?;
        Ok(channel.on_notification(handler))
    }

    /// Close both channels without a shutdown handshake. Prefer the
    /// manager's `terminate` for a graceful exit.
    pub async fn close(&self) {
        self.close_channels().await;
        self.set_state(ProcessState::Stopped);
    }

    pub(crate) async fn close_channels(&self) {
        let control = self.inner.control.lock().take();
        let data = self.inner.data.lock().take();
        if let Some(channel) = control {
            channel.close().await;
        }
        if let Some(data) = data {
            data.close().await;
        }
    }

    pub(crate) fn install_life(
        &self,
        control: Channel,
        data: Option<DataChannel>,
        pid: Option<u32>,
    ) {
        *self.inner.control.lock() = Some(control);
        *self.inner.data.lock() = data;
        *self.inner.pid.lock() = pid;
        self.set_state(ProcessState::Running);
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        *self.inner.state.lock() = state;
    }

    fn live_control(&self, method: &str) -> Result<Channel, ProcessError> {
        if is_reserved_method(method) {
            return Err(ProcessError::Channel(forkwire_core::ChannelError::state(
                format!("method {method:?} is reserved for the runtime"),
            )));
        }
        self.control_channel().ok_or_else(|| self.not_running())
    }

    fn not_running(&self) -> ProcessError {
        ProcessError::NotRunning {
            id: self.inner.id.clone(),
            state: self.state().name(),
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}
