use forkwire_core::ChannelError;
use thiserror::Error;

/// Errors surfaced by the process manager and its handles.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// `spawn` was called with an id that is already registered.
    #[error("process id {0:?} already exists")]
    DuplicateId(String),

    /// No process is registered under this id.
    #[error("no process with id {0:?}")]
    UnknownId(String),

    /// `request_via_data` on a process spawned without a data channel.
    #[error("no data channel configured for process {0:?}")]
    NoDataChannel(String),

    /// The process is not in a state that allows the operation.
    #[error("process {id:?} is {state}")]
    NotRunning { id: String, state: &'static str },

    /// A second shutdown was initiated while one is in flight.
    #[error("shutdown already in progress for process {0:?}")]
    ShutdownInProgress(String),

    /// The underlying channel stack failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
