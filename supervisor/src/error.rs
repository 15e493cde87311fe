//! Error types for the Switchboard supervisor.
//!
//! All fallible supervisor operations return [`SupervisorError`]. Lifecycle
//! failures that an operator acts on directly ([`AlreadyRunning`],
//! [`NotRunning`], [`StartFailed`]) carry enough context to print as-is.
//!
//! [`AlreadyRunning`]: SupervisorError::AlreadyRunning
//! [`NotRunning`]: SupervisorError::NotRunning
//! [`StartFailed`]: SupervisorError::StartFailed

use thiserror::Error;

use crate::supervisor::ExitKind;

/// Errors that can occur during supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A start was requested while the listener is already running.
    #[error("listener is already running (pid {pid})")]
    AlreadyRunning {
        /// Pid of the running listener.
        pid: u32,
    },

    /// A stop was requested while no listener is running.
    #[error("listener is not running")]
    NotRunning,

    /// The listener process could not be spawned at all.
    #[error("failed to spawn listener: {0}")]
    Spawn(#[source] std::io::Error),

    /// The listener exited during its startup grace period.
    #[error("listener exited during startup: {exit}")]
    StartFailed {
        /// Classified exit of the short-lived process.
        exit: ExitKind,
    },

    /// An I/O error occurred (pid file, log file, process table).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;
