use crate::{ChannelError, SocketTransport, Transport, cleanup_endpoint};

/// Local-socket server: binds an endpoint and surfaces each accepted
/// connection as a client-like [`Transport`].
pub struct SocketServer {
    path: String,
    #[cfg(unix)]
    listener: tokio::sync::Mutex<Option<tokio::net::UnixListener>>,
    #[cfg(windows)]
    next: tokio::sync::Mutex<Option<tokio::net::windows::named_pipe::NamedPipeServer>>,
}

impl SocketServer {
    /// Bind `path`, clearing any stale socket file left by a previous run.
    pub fn bind(path: impl Into<String>) -> Result<Self, ChannelError> {
        let path = path.into();

        #[cfg(unix)]
        {
            cleanup_endpoint(&path)?;
            let listener = tokio::net::UnixListener::bind(&path)
                .map_err(|err| ChannelError::transport(format!("bind {path}: {err}")))?;
            tracing::debug!(%path, "socket server bound");
            Ok(Self {
                path,
                listener: tokio::sync::Mutex::new(Some(listener)),
            })
        }

        #[cfg(windows)]
        {
            let first = tokio::net::windows::named_pipe::ServerOptions::new()
                .first_pipe_instance(true)
                .create(&path)
                .map_err(|err| ChannelError::transport(format!("bind {path}: {err}")))?;
            tracing::debug!(%path, "named pipe server bound");
            Ok(Self {
                path,
                next: tokio::sync::Mutex::new(Some(first)),
            })
        }
    }

    /// The endpoint this server listens on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> Result<Transport, ChannelError> {
        #[cfg(unix)]
        {
            let mut guard = self.listener.lock().await;
            let Some(listener) = guard.as_mut() else {
                return Err(ChannelError::state("server is closed"));
            };
            let (stream, _addr) = listener
                .accept()
                .await
                .map_err(|err| ChannelError::transport(format!("accept: {err}")))?;
            Ok(Transport::Socket(SocketTransport::from_stream(stream)))
        }

        #[cfg(windows)]
        {
            let mut guard = self.next.lock().await;
            let Some(server) = guard.take() else {
                return Err(ChannelError::state("server is closed"));
            };
            server
                .connect()
                .await
                .map_err(|err| ChannelError::transport(format!("accept: {err}")))?;
            // Queue the next pipe instance before handing this one out.
            *guard = Some(
                tokio::net::windows::named_pipe::ServerOptions::new()
                    .create(&self.path)
                    .map_err(|err| ChannelError::transport(format!("re-arm {}: {err}", self.path)))?,
            );
            Ok(Transport::Socket(SocketTransport::from_stream(server)))
        }
    }

    /// Stop accepting and release the endpoint.
    pub async fn close(&self) {
        #[cfg(unix)]
        {
            self.listener.lock().await.take();
            let _ = cleanup_endpoint(&self.path);
        }
        #[cfg(windows)]
        {
            self.next.lock().await.take();
        }
    }
}

impl std::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer").field("path", &self.path).finish()
    }
}
