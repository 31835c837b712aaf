use std::path::PathBuf;

use thiserror::Error;

use crate::endpoint::ConnectionId;

/// Errors that may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or file trouble.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The configuration does not describe a working agent.
    #[error("The configuration is not valid. Problem: `{0}`")]
    BadConfig(String),

    /// A server port could not be bound. Fatal at startup.
    #[error("Could not bind port {port}. Problem: {problem}")]
    Bind {
        /// The requested port, 0 for ephemeral.
        port: u16,
        /// What the OS said.
        problem: String,
    },

    /// The service directory could not be reached or refused a request.
    #[error("Service directory problem: {0}")]
    Directory(String),

    /// A log file could not be opened.
    #[error("Could not open log file in {dir:?}. Problem: {problem}")]
    LogFile {
        /// Where the file was supposed to go.
        dir: PathBuf,
        /// What went wrong.
        problem: String,
    },

    /// An outbound connection was not established in time.
    #[error("Timed out after {0:?} connecting to {1}")]
    ConnectTimeout(std::time::Duration, String),

    /// Tried writing to a connection whose owner has gone away.
    #[error("The connection `{0}` is closed")]
    ConnectionClosed(ConnectionId),

    /// The agent task has stopped.
    #[error("The agent is not running")]
    AgentGone,

    /// The router task has stopped.
    #[error("The router is not running")]
    RouterGone,

    /// A server or link task panicked or was cancelled.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

impl Error {
    /// Get the problem description if this is [`Error::BadConfig`].
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(problem) = self {
            Ok(problem)
        } else {
            Err(self)
        }
    }
}
