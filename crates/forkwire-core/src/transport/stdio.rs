use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as AsyncMutex;

use crate::{ChannelError, EventHub, TransportEvent, TransportState};

const READ_CHUNK: usize = 8 * 1024;

/// How to spawn the worker process.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Child-process transport: bytes over the child's stdin/stdout, stderr
/// surfaced line-by-line as [`TransportEvent::Stderr`].
#[derive(Clone)]
pub struct StdioTransport {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    spec: CommandSpec,
    state: Mutex<TransportState>,
    events: EventHub<TransportEvent>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    stdout: AsyncMutex<Option<ChildStdout>>,
    child: Mutex<Option<Child>>,
    pid: Mutex<Option<u32>>,
}

impl StdioTransport {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            inner: Arc::new(StdioInner {
                spec,
                state: Mutex::new(TransportState::Disconnected),
                events: EventHub::new(),
                stdin: AsyncMutex::new(None),
                stdout: AsyncMutex::new(None),
                child: Mutex::new(None),
                pid: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    pub fn events(&self) -> &EventHub<TransportEvent> {
        &self.inner.events
    }

    /// Pid of the spawned child, while one is running.
    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock()
    }

    /// Hand the child handle to a supervisor for `wait()`/`kill()`.
    ///
    /// After this the transport keeps streaming the child's pipes but no
    /// longer owns its lifetime.
    pub fn take_child(&self) -> Option<Child> {
        self.inner.child.lock().take()
    }

    /// Forcefully kill the child, if this transport still owns it.
    pub fn start_kill(&self) -> Result<(), ChannelError> {
        match self.inner.child.lock().as_mut() {
            Some(child) => child.start_kill().map_err(ChannelError::from),
            None => Ok(()),
        }
    }

    /// Spawn the child and wire up its three pipes.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                TransportState::Connected | TransportState::Connecting => {
                    return Err(ChannelError::state("transport already connected"));
                }
                _ => *state = TransportState::Connecting,
            }
        }

        let spec = &self.inner.spec;
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.envs {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                *self.inner.state.lock() = TransportState::Error;
                let err = ChannelError::transport(format!(
                    "failed to spawn {}: {err}",
                    spec.program
                ));
                self.inner.events.emit(&TransportEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        debug_assert!(stdin.is_some() && stdout.is_some() && stderr.is_some());

        let pid = child.id();
        *self.inner.stdin.lock().await = stdin;
        *self.inner.stdout.lock().await = stdout;
        *self.inner.pid.lock() = pid;
        *self.inner.child.lock() = Some(child);

        if let Some(stderr) = stderr {
            let events = self.inner.events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "forkwire::stderr", %line, "child stderr");
                    events.emit(&TransportEvent::Stderr(line));
                }
            });
        }

        *self.inner.state.lock() = TransportState::Connected;
        self.inner.events.emit(&TransportEvent::Connected);
        tracing::debug!(program = %spec.program, ?pid, "child spawned");
        Ok(())
    }

    pub async fn write(&self, bytes: Bytes) -> Result<(), ChannelError> {
        if self.state() != TransportState::Connected {
            return Err(ChannelError::state("write on a transport that is not connected"));
        }
        let mut stdin = self.inner.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(ChannelError::state("child stdin already released"));
        };
        if let Err(err) = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await
        {
            self.fail(&err);
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn recv(&self) -> Result<Option<Bytes>, ChannelError> {
        let mut stdout = self.inner.stdout.lock().await;
        let Some(reader) = stdout.as_mut() else {
            return Ok(None);
        };
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                drop(stdout);
                self.close_state();
                Ok(None)
            }
            Ok(_) => Ok(Some(buf.freeze())),
            Err(err) => {
                drop(stdout);
                self.fail(&err);
                Err(err.into())
            }
        }
    }

    /// Close the child's stdin (signalling EOF) and stop reading.
    pub async fn disconnect(&self) -> Result<(), ChannelError> {
        if let Some(mut stdin) = self.inner.stdin.lock().await.take() {
            let _ = stdin.flush().await;
            let _ = stdin.shutdown().await;
        }
        self.inner.stdout.lock().await.take();
        self.close_state();
        Ok(())
    }

    fn fail(&self, err: &std::io::Error) {
        *self.inner.state.lock() = TransportState::Error;
        self.inner
            .events
            .emit(&TransportEvent::Error(err.to_string()));
    }

    fn close_state(&self) {
        let mut state = self.inner.state.lock();
        if *state != TransportState::Closed {
            *state = TransportState::Closed;
            drop(state);
            self.inner.events.emit(&TransportEvent::Disconnected);
        }
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("program", &self.inner.spec.program)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
