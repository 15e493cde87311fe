//! Switchboard Supervisor - listener process lifecycle manager.
//!
//! This crate manages a Switchboard listener as a supervised OS process:
//! starting it, watching that it survived startup, stopping it with SIGTERM
//! escalating to SIGKILL, restarting it, and reporting its state with a
//! classified exit for the previous run.
//!
//! # Overview
//!
//! The supervisor records the listener's pid in a pid file under a state
//! directory and reconciles that file against the OS process table on every
//! operation. That lets one invocation stop or inspect a listener that a
//! completely different invocation started, and lets a crashed listener be
//! detected by the stale pid file it left behind.
//!
//! The supervisor never restarts the listener automatically. In particular
//! an authentication failure (exit 3) would recur on every attempt until
//! the operator fixes the token, so restarts are always explicit.
//!
//! # Modules
//!
//! - [`error`]: Supervisor error types
//! - [`log_buffer`]: Bounded ring of captured listener output
//! - [`pidfile`]: Pid file persistence and process-table liveness
//! - [`supervisor`]: Lifecycle operations and exit classification

pub mod error;
pub mod log_buffer;
pub mod pidfile;
pub mod supervisor;

pub use error::{Result, SupervisorError};
pub use log_buffer::{read_tail, LogRing, DEFAULT_LOG_CAPACITY};
pub use pidfile::{is_alive, process_uptime, PidFile};
pub use supervisor::{ExitKind, ListenerCommand, LogSink, ProcessState, Status, Supervisor};
