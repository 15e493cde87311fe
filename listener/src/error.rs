//! Error types for the Switchboard listener.
//!
//! This module defines the top-level error type returned by the listener's
//! entry points, and the process exit codes those errors map to. A
//! supervisor (or shell script) can tell from the exit code alone whether
//! the listener stopped cleanly, refused its configuration, was rejected by
//! the platform, or gave up on the connection.

use thiserror::Error;

use crate::config::ConfigError;
use crate::dispatch::DispatchError;

/// Exit code for a graceful shutdown.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for runtime failures with no more specific classification.
pub const EXIT_FAILURE: i32 = 1;

/// Exit code when the configuration is rejected, including a disabled bot.
pub const EXIT_CONFIG_REJECTED: i32 = 2;

/// Exit code when the platform rejects the bot credential.
pub const EXIT_AUTH_FAILURE: i32 = 3;

/// Exit code when the reconnection budget is exhausted.
pub const EXIT_CONNECTION_EXHAUSTED: i32 = 4;

/// Errors that stop the listener.
///
/// Each variant carries enough context for the log line, and
/// [`ListenerError::exit_code`] decides what the process reports to its
/// parent.
#[derive(Error, Debug)]
pub enum ListenerError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The bot is switched off in configuration.
    #[error("bot is disabled in configuration (set enabled = true under [bot] to start)")]
    BotDisabled,

    /// The platform rejected the bot credential.
    #[error("authentication rejected: {message} (update the token under [bot] and restart)")]
    AuthRejected {
        /// Reason reported by the gateway.
        message: String,
    },

    /// Too many consecutive connection failures.
    #[error("gave up after {attempts} consecutive failed connection attempts")]
    ConnectionExhausted {
        /// Connection attempts made before giving up.
        attempts: u32,
    },

    /// A webhook delivery or probe failed.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl ListenerError {
    /// The process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::BotDisabled => EXIT_CONFIG_REJECTED,
            Self::AuthRejected { .. } => EXIT_AUTH_FAILURE,
            Self::ConnectionExhausted { .. } => EXIT_CONNECTION_EXHAUSTED,
            Self::Dispatch(_) => EXIT_FAILURE,
        }
    }
}

/// A specialized `Result` type for listener operations.
pub type Result<T> = std::result::Result<T, ListenerError>;
