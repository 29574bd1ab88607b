use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use forkwire_core::{
    Channel, ChannelError, ChannelOptions, CommandSpec, EventHub, SocketServer, StdioTransport,
    Transport,
};

use crate::{
    DATA_CHANNEL_ERROR, DATA_CHANNEL_READY, DataChannel, DataChannelInfo, DataOptions, DataRole,
    HANDSHAKE, HEARTBEAT_PING, HEARTBEAT_PONG, HandshakeParams, HeartbeatPing, HeartbeatPong,
    PROTOCOL_VERSION, ProcessError, ProcessHandle, ProcessState, ShutdownManager, ShutdownOptions,
    ShutdownReason,
};

/// Events published on the manager's bus (and each handle's own hub).
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Spawned { id: String, pid: Option<u32> },
    Ready { id: String },
    Exited { id: String, code: Option<i32> },
    Crashed { id: String, reason: String },
    Restarting { id: String, attempt: u32, delay: Duration },
    DataChannelReady { id: String },
    HeartbeatMissed { id: String, misses: u32 },
    Error { id: String, error: String },
}

/// When and how often a crashed process is respawned.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_restarts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_restarts: 3,
            backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RestartPolicy {
    /// Doubling backoff, capped: `backoff * 2^restart_count` up to
    /// `max_backoff`.
    pub fn next_delay(&self, restart_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(restart_count);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Whether a life that ended with `exit_code` gets another one. Manual
    /// termination and clean exits never restart.
    pub fn should_restart(&self, exit_code: Option<i32>, manual: bool, restart_count: u32) -> bool {
        !manual && exit_code != Some(0) && self.enabled && restart_count < self.max_restarts
    }
}

/// Liveness probing over the reserved heartbeat notifications.
#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub interval: Duration,
    /// Consecutive unanswered pings tolerated before the worker is
    /// declared dead.
    pub miss_limit: u32,
}

/// Configuration of a process's optional binary data channel.
#[derive(Clone)]
pub struct DataChannelConfig {
    /// Endpoint the server binds and the worker dials; see
    /// [`forkwire_core::endpoint_path`].
    pub endpoint: String,
    /// Codec name advertised to the worker in the handshake.
    pub serialization: String,
    pub options: DataOptions,
}

/// Everything `spawn` needs to bring a worker up.
#[derive(Clone)]
pub struct SpawnOptions {
    pub command: CommandSpec,
    pub channel: ChannelOptions,
    pub restart: RestartPolicy,
    pub heartbeat: Option<HeartbeatOptions>,
    pub data_channel: Option<DataChannelConfig>,
    /// Budget for the handshake (and data-channel accept) on each life.
    pub ready_timeout: Duration,
    pub shutdown: ShutdownOptions,
    /// Capabilities advertised in the handshake.
    pub capabilities: Vec<String>,
}

impl SpawnOptions {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            channel: ChannelOptions::default(),
            restart: RestartPolicy::default(),
            heartbeat: None,
            data_channel: None,
            ready_timeout: Duration::from_secs(10),
            shutdown: ShutdownOptions::default(),
            capabilities: Vec::new(),
        }
    }
}

struct ManagedProcess {
    handle: ProcessHandle,
    options: SpawnOptions,
    restart_count: u32,
    kill_tx: Option<mpsc::Sender<()>>,
}

/// Registry of supervised worker processes.
///
/// `spawn` brings a worker up (child process, control channel, handshake,
/// optional data channel) and returns its [`ProcessHandle`]; the manager
/// then watches the child and applies the restart policy, heartbeats, and
/// shutdown flows.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    events: EventHub<ProcessEvent>,
    shutdown: ShutdownManager,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                processes: Mutex::new(HashMap::new()),
                events: EventHub::new(),
                shutdown: ShutdownManager::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventHub<ProcessEvent> {
        &self.inner.events
    }

    /// Events from the graceful-shutdown flows.
    pub fn shutdown_events(&self) -> &EventHub<crate::ShutdownEvent> {
        self.inner.shutdown.events()
    }

    /// Spawn a worker and wait for it to become ready.
    ///
    /// Ready means the worker answered the reserved handshake; with a data
    /// channel configured it also means the worker dialed back in and
    /// confirmed with the reserved ready notification. A duplicate id
    /// fails immediately.
    pub async fn spawn(&self, id: &str, options: SpawnOptions) -> Result<ProcessHandle, ProcessError> {
        let handle = ProcessHandle::new(id);
        {
            let mut processes = self.inner.processes.lock();
            if processes.contains_key(id) {
                return Err(ProcessError::DuplicateId(id.to_owned()));
            }
            processes.insert(
                id.to_owned(),
                ManagedProcess {
                    handle: handle.clone(),
                    options: options.clone(),
                    restart_count: 0,
                    kill_tx: None,
                },
            );
        }

        match ManagerInner::start_life(&self.inner, id, &options, &handle).await {
            Ok(()) => {
                self.inner.emit(&ProcessEvent::Spawned {
                    id: id.to_owned(),
                    pid: handle.pid(),
                });
                self.inner.emit(&ProcessEvent::Ready { id: id.to_owned() });
                Ok(handle)
            }
            Err(err) => {
                self.inner.processes.lock().remove(id);
                handle.set_state(ProcessState::Stopped);
                Err(err)
            }
        }
    }

    pub fn get_handle(&self, id: &str) -> Option<ProcessHandle> {
        self.inner
            .processes
            .lock()
            .get(id)
            .map(|entry| entry.handle.clone())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.get_handle(id).is_some_and(|handle| handle.is_running())
    }

    /// Gracefully terminate one process (shutdown handshake, then force
    /// kill on silence) and drop it from the registry.
    pub async fn terminate(&self, id: &str, reason: ShutdownReason) -> Result<(), ProcessError> {
        ManagerInner::terminate(&self.inner, id, reason).await
    }

    /// Terminate every registered process.
    pub async fn terminate_all(&self) {
        let ids: Vec<String> = self.inner.processes.lock().keys().cloned().collect();
        for id in ids {
            if let Err(err) =
                ManagerInner::terminate(&self.inner, &id, ShutdownReason::ManagerShutdown).await
            {
                tracing::warn!(id = %id, error = %err, "terminate failed");
            }
        }
    }
}

impl ManagerInner {
    fn emit(&self, event: &ProcessEvent) {
        self.events.emit(event);
        let id = match event {
            ProcessEvent::Spawned { id, .. }
            | ProcessEvent::Ready { id }
            | ProcessEvent::Exited { id, .. }
            | ProcessEvent::Crashed { id, .. }
            | ProcessEvent::Restarting { id, .. }
            | ProcessEvent::DataChannelReady { id }
            | ProcessEvent::HeartbeatMissed { id, .. }
            | ProcessEvent::Error { id, .. } => id,
        };
        if let Some(handle) = self.processes.lock().get(id).map(|e| e.handle.clone()) {
            handle.events().emit(event);
        }
    }

    /// Bring up one life: spawn the child, handshake, data channel,
    /// monitor, heartbeat.
    async fn start_life(
        inner: &Arc<ManagerInner>,
        id: &str,
        options: &SpawnOptions,
        handle: &ProcessHandle,
    ) -> Result<(), ProcessError> {
        let transport = Transport::child(options.command.clone());
        let channel = Channel::json_rpc(transport, options.channel.clone());
        channel.start().await?;
        let stdio = channel
            .transport()
            .as_stdio()
            .expect("child transport is stdio")
            .clone();

        match Self::wire_life(inner, id, options, handle, &channel, &stdio).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = stdio.start_kill();
                channel.close().await;
                Err(err)
            }
        }
    }

    async fn wire_life(
        inner: &Arc<ManagerInner>,
        id: &str,
        options: &SpawnOptions,
        handle: &ProcessHandle,
        channel: &Channel,
        stdio: &StdioTransport,
    ) -> Result<(), ProcessError> {
        let pid = stdio.pid();

        // Bound before the handshake so the advertised endpoint is live by
        // the time the worker reads it.
        let server = match &options.data_channel {
            Some(config) => Some(SocketServer::bind(&config.endpoint)?),
            None => None,
        };

        let last_pong = Arc::new(AtomicU64::new(0));
        // Armed before the handshake so the worker's data-channel verdict
        // cannot slip past the listener. Resolves `Ok` on
        // `__data_channel_ready__`, `Err` on `__data_channel_error__`.
        let data_signal: Arc<Mutex<Option<oneshot::Sender<Result<(), String>>>>> =
            Arc::new(Mutex::new(None));
        let data_ready = options.data_channel.as_ref().map(|_| {
            let (tx, rx) = oneshot::channel();
            *data_signal.lock() = Some(tx);
            rx
        });
        {
            let last_pong = Arc::clone(&last_pong);
            let data_signal = Arc::clone(&data_signal);
            let events = inner.events.clone();
            let id = id.to_owned();
            // Stays registered for this life; the channel drops it on close.
            let _ = channel.on_notification(move |method, params| match method {
                HEARTBEAT_PONG => {
                    if let Some(pong) = params
                        .and_then(|p| serde_json::from_value::<HeartbeatPong>(p.clone()).ok())
                    {
                        last_pong.fetch_max(pong.seq, Ordering::SeqCst);
                    }
                }
                DATA_CHANNEL_READY => {
                    if let Some(tx) = data_signal.lock().take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                DATA_CHANNEL_ERROR => {
                    let detail = params
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "unknown".to_owned());
                    match data_signal.lock().take() {
                        // Mid-bringup: fail the spawn through the waiter.
                        Some(tx) => {
                            let _ = tx.send(Err(detail));
                        }
                        // After bringup (or never configured): surface it.
                        None => events.emit(&ProcessEvent::Error {
                            id: id.clone(),
                            error: format!("worker reported data channel failure: {detail}"),
                        }),
                    }
                }
                _ => {}
            });
        }

        let handshake = HandshakeParams {
            version: PROTOCOL_VERSION.to_owned(),
            capabilities: options.capabilities.clone(),
            data_channel: options.data_channel.as_ref().map(|config| DataChannelInfo {
                path: config.endpoint.clone(),
                serialization: config.serialization.clone(),
            }),
        };
        let handshake = serde_json::to_value(&handshake)
            .map_err(ChannelError::from)?;
        channel
            .request(HANDSHAKE, Some(handshake), Some(options.ready_timeout))
            .await?;
        tracing::debug!(id, ?pid, "worker handshake complete");

        let data = match (server, &options.data_channel, data_ready) {
            (Some(server), Some(config), Some(ready)) => {
                let deadline = |during: &'static str| ChannelError::Timeout {
                    during,
                    after: options.ready_timeout,
                };

                // The accept and the worker's verdict race: a worker whose
                // dial succeeded connects and then confirms on the control
                // channel, while one whose dial failed only ever reports
                // the error.
                let mut ready = ready;
                let mut confirmed = false;
                let accepted = tokio::select! {
                    accepted = tokio::time::timeout(options.ready_timeout, server.accept()) => {
                        accepted.map_err(|_| deadline("data channel accept"))??
                    }
                    verdict = &mut ready => match verdict {
                        Ok(Ok(())) => {
                            confirmed = true;
                            tokio::time::timeout(options.ready_timeout, server.accept())
                                .await
                                .map_err(|_| deadline("data channel accept"))??
                        }
                        Ok(Err(detail)) => {
                            return Err(ChannelError::transport(format!(
                                "worker data channel failed: {detail}"
                            ))
                            .into());
                        }
                        Err(_) => return Err(ChannelError::Closed.into()),
                    },
                };
                server.close().await;

                if !confirmed {
                    // The connection alone is not the ready signal; the
                    // worker still has to confirm it.
                    match tokio::time::timeout(options.ready_timeout, ready).await {
                        Ok(Ok(Ok(()))) => {}
                        Ok(Ok(Err(detail))) => {
                            return Err(ChannelError::transport(format!(
                                "worker data channel failed: {detail}"
                            ))
                            .into());
                        }
                        Ok(Err(_)) => return Err(ChannelError::Closed.into()),
                        Err(_) => return Err(deadline("data channel ready").into()),
                    }
                }

                let data = DataChannel::new(accepted, DataRole::Parent, config.options.clone());
                data.start().await?;
                inner.emit(&ProcessEvent::DataChannelReady { id: id.to_owned() });
                Some(data)
            }
            _ => None,
        };

        handle.install_life(channel.clone(), data, pid);

        let (kill_tx, kill_rx) = mpsc::channel(1);
        if let Some(entry) = inner.processes.lock().get_mut(id) {
            entry.kill_tx = Some(kill_tx);
        }
        if let Some(child) = stdio.take_child() {
            tokio::spawn(Self::monitor(
                Arc::clone(inner),
                id.to_owned(),
                child,
                kill_rx,
                handle.clone(),
            ));
        }

        if let Some(heartbeat) = &options.heartbeat {
            tokio::spawn(Self::heartbeat(
                Arc::clone(inner),
                id.to_owned(),
                channel.clone(),
                heartbeat.clone(),
                last_pong,
            ));
        }
        Ok(())
    }

    /// Watch one life's child until it exits; apply the restart policy.
    ///
    /// Boxed so the respawn path (which spawns a fresh monitor) does not
    /// produce an infinitely recursive future type.
    fn monitor(
        inner: Arc<ManagerInner>,
        id: String,
        mut child: Child,
        mut kill_rx: mpsc::Receiver<()>,
        handle: ProcessHandle,
    ) -> BoxFuture<'static, ()> {
        async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    command = kill_rx.recv() => match command {
                        Some(()) => {
                            let _ = child.start_kill();
                        }
                        None => break child.wait().await,
                    },
                }
            };
            let code = status.as_ref().ok().and_then(|s| s.code());
            let manual = handle.state() == ProcessState::Stopping;

            // Channel close rejects every then-pending request.
            handle.close_channels().await;
            inner.emit(&ProcessEvent::Exited {
                id: id.clone(),
                code,
            });
            tracing::info!(id = %id, ?code, manual, "worker exited");

            if manual || code == Some(0) {
                handle.set_state(ProcessState::Stopped);
                return;
            }

            handle.set_state(ProcessState::Crashed);
            inner.emit(&ProcessEvent::Crashed {
                id: id.clone(),
                reason: match code {
                    Some(code) => format!("exit code {code}"),
                    None => "killed by signal".to_owned(),
                },
            });

            let decision = inner
                .processes
                .lock()
                .get(&id)
                .map(|entry| (entry.options.clone(), entry.restart_count));
            let Some((options, restart_count)) = decision else {
                return;
            };
            if !options.restart.should_restart(code, manual, restart_count) {
                return;
            }

            let delay = options.restart.next_delay(restart_count);
            inner.emit(&ProcessEvent::Restarting {
                id: id.clone(),
                attempt: restart_count + 1,
                delay,
            });
            tracing::info!(id = %id, attempt = restart_count + 1, ?delay, "restarting worker");
            tokio::time::sleep(delay).await;

            // The process may have been terminated during the backoff.
            let still_there = inner
                .processes
                .lock()
                .get(&id)
                .is_some_and(|entry| entry.handle.state() != ProcessState::Stopping);
            if !still_there {
                return;
            }

            handle.set_state(ProcessState::Starting);
            match Self::start_life(&inner, &id, &options, &handle).await {
                Ok(()) => {
                    if let Some(entry) = inner.processes.lock().get_mut(&id) {
                        entry.restart_count += 1;
                    }
                    inner.emit(&ProcessEvent::Spawned {
                        id: id.clone(),
                        pid: handle.pid(),
                    });
                    inner.emit(&ProcessEvent::Ready { id: id.clone() });
                }
                Err(err) => {
                    handle.set_state(ProcessState::Crashed);
                    inner.emit(&ProcessEvent::Error {
                        id: id.clone(),
                        error: format!("restart failed: {err}"),
                    });
                }
            }
        }
        .boxed()
    }

    async fn heartbeat(
        inner: Arc<ManagerInner>,
        id: String,
        channel: Channel,
        options: HeartbeatOptions,
        last_pong: Arc<AtomicU64>,
    ) {
        let mut seq: u64 = 0;
        loop {
            tokio::time::sleep(options.interval).await;
            if !channel.is_connected() {
                break;
            }
            seq += 1;
            let ping = HeartbeatPing {
                timestamp: unix_millis(),
                seq,
            };
            if channel
                .notify(HEARTBEAT_PING, serde_json::to_value(&ping).ok())
                .await
                .is_err()
            {
                break;
            }

            let behind = seq.saturating_sub(last_pong.load(Ordering::SeqCst));
            if behind > u64::from(options.miss_limit) {
                inner.emit(&ProcessEvent::HeartbeatMissed {
                    id: id.clone(),
                    misses: behind as u32,
                });
                tracing::warn!(id = %id, misses = behind, "worker heartbeat dead");
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(err) =
                        Self::terminate(&inner, &id, ShutdownReason::HeartbeatDead).await
                    {
                        tracing::warn!(id = %id, error = %err, "heartbeat-triggered terminate failed");
                    }
                });
                break;
            }
        }
    }

    async fn terminate(
        inner: &Arc<ManagerInner>,
        id: &str,
        reason: ShutdownReason,
    ) -> Result<(), ProcessError> {
        let (handle, shutdown_options, kill_tx) = {
            let processes = inner.processes.lock();
            let entry = processes
                .get(id)
                .ok_or_else(|| ProcessError::UnknownId(id.to_owned()))?;
            (
                entry.handle.clone(),
                entry.options.shutdown.clone(),
                entry.kill_tx.clone(),
            )
        };
        handle.set_state(ProcessState::Stopping);

        match handle.control_channel() {
            Some(channel) if channel.is_connected() => {
                let kill = move || {
                    if let Some(tx) = kill_tx {
                        let _ = tx.try_send(());
                    }
                };
                inner
                    .shutdown
                    .shutdown(id, &channel, reason, &shutdown_options, kill)
                    .await?;
            }
            _ => {
                // No live channel to negotiate over; kill outright.
                if let Some(tx) = kill_tx {
                    let _ = tx.try_send(());
                }
            }
        }

        handle.close_channels().await;
        inner.processes.lock().remove(id);
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
