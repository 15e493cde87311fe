//! Listener process lifecycle management.
//!
//! [`Supervisor`] owns the full lifecycle of a single listener process:
//! spawning it, confirming it survived startup, capturing its output,
//! stopping it with SIGTERM escalating to SIGKILL, and classifying how it
//! exited. All lifecycle operations are serialized through one async mutex,
//! so a stop racing a restart cannot interleave half-finished transitions.
//!
//! The supervisor never restarts the listener on its own. A listener that
//! exited because its token was rejected would just fail again in a loop;
//! the operator decides when a restart is warranted.
//!
//! # Example
//!
//! ```no_run
//! use switchboard_supervisor::{ListenerCommand, Supervisor};
//!
//! # async fn example() -> Result<(), switchboard_supervisor::SupervisorError> {
//! let command = ListenerCommand::listener("switchboard-listener", None, None);
//! let supervisor = Supervisor::new(command, "/var/lib/switchboard");
//!
//! let pid = supervisor.start().await?;
//! println!("listener running as pid {pid}");
//! # Ok(())
//! # }
//! ```

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SupervisorError};
use crate::log_buffer::{read_tail, LogRing, DEFAULT_LOG_CAPACITY};
use crate::pidfile::{is_alive, process_uptime, PidFile};

/// Seconds a freshly spawned listener gets to prove itself before the start
/// is declared successful.
const STARTUP_GRACE_SECS: u64 = 2;

/// Seconds to wait after SIGTERM before escalating to SIGKILL.
const STOP_GRACE_SECS: u64 = 10;

/// Milliseconds to wait for a SIGKILLed process to leave the process table.
const KILL_CONFIRM_TIMEOUT_MS: u64 = 2000;

/// Milliseconds between process-table liveness polls.
const LIVENESS_POLL_INTERVAL_MS: u64 = 100;

/// File name of the listener log file under the state directory.
const LOG_FILE_NAME: &str = "switchboard-listener.log";

/// Lifecycle state of the supervised listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No listener process exists.
    NotRunning,
    /// A listener was spawned and is inside its startup grace period.
    Starting,
    /// The listener is alive.
    Running,
    /// A stop is in progress.
    Stopping,
    /// The listener died without a clean stop.
    Crashed,
}

impl ProcessState {
    /// Returns the state name as a stable string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRunning => "not_running",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of how a listener process exited.
///
/// Exit codes follow the listener's convention: 0 graceful, 2 configuration
/// rejected, 3 authentication failure, 4 connection retries exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Clean shutdown (exit 0).
    Graceful,
    /// The listener refused its configuration (exit 2).
    ConfigRejected,
    /// The platform rejected the listener's token (exit 3).
    AuthFailure,
    /// The listener gave up reconnecting (exit 4).
    ConnectionExhausted,
    /// Any other nonzero exit code.
    Crashed(i32),
    /// The process was terminated by a signal.
    Killed(i32),
}

impl ExitKind {
    /// Classifies a wait status from the OS.
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Killed(signal);
            }
        }

        match status.code() {
            Some(0) => Self::Graceful,
            Some(2) => Self::ConfigRejected,
            Some(3) => Self::AuthFailure,
            Some(4) => Self::ConnectionExhausted,
            Some(code) => Self::Crashed(code),
            None => Self::Crashed(-1),
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::ConfigRejected => write!(f, "configuration rejected (exit 2)"),
            Self::AuthFailure => write!(f, "authentication failure (exit 3)"),
            Self::ConnectionExhausted => write!(f, "connection retries exhausted (exit 4)"),
            Self::Crashed(code) => write!(f, "crashed (exit {code})"),
            Self::Killed(signal) => write!(f, "killed (signal {signal})"),
        }
    }
}

/// Where the listener's stdout and stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    /// Pipe output into an in-memory ring readable via
    /// [`Supervisor::tail_logs`]. The listener dies with the supervisor
    /// process, so this suits embedding and tests.
    Capture,
    /// Redirect output to an append-only log file under the state
    /// directory. The listener survives the supervisor process exiting,
    /// which is what the CLI wants.
    File,
}

/// Command line used to launch the listener.
#[derive(Debug, Clone)]
pub struct ListenerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ListenerCommand {
    /// Creates a command that runs `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    /// Builds the standard listener invocation:
    /// `<bin> run [--config <path>] [--feed <path>]`.
    #[must_use]
    pub fn listener(
        bin: impl Into<PathBuf>,
        config: Option<&std::path::Path>,
        feed: Option<&std::path::Path>,
    ) -> Self {
        let mut command = Self::new(bin).arg("run");
        if let Some(config) = config {
            command = command.arg("--config").arg(config);
        }
        if let Some(feed) = feed {
            command = command.arg("--feed").arg(feed);
        }
        command
    }

    fn build(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        // The listener must outlive a dropped handle (detached CLI starts).
        command.kill_on_drop(false);
        command
    }
}

impl fmt::Display for ListenerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Snapshot of the supervised listener, as reported by
/// [`Supervisor::status`].
#[derive(Debug, Clone)]
pub struct Status {
    /// Current lifecycle state.
    pub state: ProcessState,
    /// Pid of the running listener, if one is alive.
    pub pid: Option<u32>,
    /// How long the listener has been running, if it is.
    pub uptime: Option<Duration>,
    /// Classified exit of the most recent run, if one has ended.
    pub last_exit: Option<ExitKind>,
}

struct Inner {
    command: ListenerCommand,
    pid_file: PidFile,
    child: Option<Child>,
    state: ProcessState,
    started_at: Option<SystemTime>,
    last_exit: Option<ExitKind>,
}

/// Manages the lifecycle of a single listener process.
///
/// `start`, `stop`, `restart` and `status` all take the same internal lock,
/// so operations issued concurrently execute one at a time.
/// [`tail_logs`](Self::tail_logs) deliberately does not take that lock and
/// stays responsive while a lifecycle operation is in flight.
pub struct Supervisor {
    inner: Mutex<Inner>,
    logs: Arc<StdMutex<LogRing>>,
    sink: LogSink,
    state_dir: PathBuf,
    startup_grace: Duration,
    stop_grace: Duration,
}

impl Supervisor {
    /// Creates a supervisor for `command` with state under `state_dir`.
    ///
    /// Defaults to [`LogSink::Capture`]; the CLI switches to
    /// [`LogSink::File`] so started listeners survive it.
    #[must_use]
    pub fn new(command: ListenerCommand, state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            inner: Mutex::new(Inner {
                command,
                pid_file: PidFile::new(&state_dir),
                child: None,
                state: ProcessState::NotRunning,
                started_at: None,
                last_exit: None,
            }),
            logs: Arc::new(StdMutex::new(LogRing::new(DEFAULT_LOG_CAPACITY))),
            sink: LogSink::Capture,
            state_dir,
            startup_grace: Duration::from_secs(STARTUP_GRACE_SECS),
            stop_grace: Duration::from_secs(STOP_GRACE_SECS),
        }
    }

    /// Selects where listener output goes.
    #[must_use]
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    /// Overrides the startup grace period.
    #[must_use]
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Overrides the SIGTERM-to-SIGKILL escalation timeout.
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Overrides the captured-log ring capacity.
    #[must_use]
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.logs = Arc::new(StdMutex::new(LogRing::new(capacity)));
        self
    }

    /// Path of the log file used by [`LogSink::File`].
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join(LOG_FILE_NAME)
    }

    /// Starts the listener and returns its pid.
    ///
    /// Fails with [`SupervisorError::AlreadyRunning`] if a listener is
    /// already alive, whether started by this supervisor or found via the
    /// pid file. A stale pid file left by a crashed listener is cleaned up
    /// and does not block the start.
    ///
    /// The start is confirmed by the first captured output line or by the
    /// startup grace period elapsing, whichever comes first. A listener
    /// that exits before then fails the start with its classified exit.
    pub async fn start(&self) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        reap_exited(&mut inner);

        if let Some(child) = &inner.child {
            if let Some(pid) = child.id() {
                return Err(SupervisorError::AlreadyRunning { pid });
            }
        }
        if let Some(pid) = inner.pid_file.read()? {
            if is_alive(pid) {
                return Err(SupervisorError::AlreadyRunning { pid });
            }
            warn!(pid, "Removing stale pid file from a dead listener");
            inner.pid_file.remove()?;
        }

        inner.state = ProcessState::Starting;
        debug!(command = %inner.command, "Spawning listener");

        let mut command = inner.command.build();
        match self.sink {
            LogSink::Capture => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            LogSink::File => {
                let stdout = self.open_log_file()?;
                let stderr = stdout.try_clone()?;
                command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            }
        }

        let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id().ok_or_else(|| {
            SupervisorError::Spawn(std::io::Error::other(
                "child exited before its pid could be read",
            ))
        })?;

        inner.pid_file.write(pid)?;
        inner.started_at = Some(SystemTime::now());

        let (first_line_tx, mut first_line_rx) = mpsc::channel::<()>(1);
        if self.sink == LogSink::Capture {
            if let Some(stdout) = child.stdout.take() {
                spawn_pump(stdout, Arc::clone(&self.logs), first_line_tx.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_pump(stderr, Arc::clone(&self.logs), first_line_tx.clone());
            }
        }
        drop(first_line_tx);

        tokio::select! {
            Some(()) = first_line_rx.recv() => {
                debug!(pid, "Listener produced output");
            }
            status = child.wait() => {
                let exit = ExitKind::from_status(status?);
                inner.pid_file.remove()?;
                inner.started_at = None;
                inner.last_exit = Some(exit);
                inner.state = ProcessState::NotRunning;
                error!(%exit, "Listener exited during startup");
                return Err(SupervisorError::StartFailed { exit });
            }
            () = sleep(self.startup_grace) => {
                debug!(pid, "Startup grace period elapsed");
            }
        }

        inner.child = Some(child);
        inner.state = ProcessState::Running;
        info!(pid, "Listener started");
        Ok(pid)
    }

    /// Stops the listener with SIGTERM, escalating to SIGKILL if it does
    /// not exit within the stop grace period.
    ///
    /// Works both on a listener this supervisor spawned and on one adopted
    /// through the pid file. Fails with [`SupervisorError::NotRunning`] if
    /// no listener is alive.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        reap_exited(&mut inner);

        if let Some(mut child) = inner.child.take() {
            inner.state = ProcessState::Stopping;
            if let Some(pid) = child.id() {
                info!(pid, "Sending SIGTERM to listener");
                send_signal(pid, false).await?;
            }

            let status = match timeout(self.stop_grace, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!("Listener ignored SIGTERM, escalating to SIGKILL");
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "Listener exited before SIGKILL landed");
                    }
                    child.wait().await?
                }
            };

            let exit = ExitKind::from_status(status);
            inner.pid_file.remove()?;
            inner.started_at = None;
            inner.last_exit = Some(exit);
            inner.state = ProcessState::NotRunning;
            info!(%exit, "Listener stopped");
            return Ok(());
        }

        // No in-memory handle, so adopt whatever the pid file points at.
        let Some(pid) = inner.pid_file.read()? else {
            return Err(SupervisorError::NotRunning);
        };
        if !is_alive(pid) {
            warn!(pid, "Removing stale pid file from a dead listener");
            inner.pid_file.remove()?;
            return Err(SupervisorError::NotRunning);
        }

        inner.state = ProcessState::Stopping;
        info!(pid, "Sending SIGTERM to adopted listener");
        send_signal(pid, false).await?;
        if !wait_for_death(pid, self.stop_grace).await {
            warn!(pid, "Adopted listener ignored SIGTERM, escalating to SIGKILL");
            send_signal(pid, true).await?;
            wait_for_death(pid, Duration::from_millis(KILL_CONFIRM_TIMEOUT_MS)).await;
        }

        // An adopted process is not our child, so its wait status is not
        // observable. The last recorded exit is left as-is.
        inner.pid_file.remove()?;
        inner.started_at = None;
        inner.state = ProcessState::NotRunning;
        info!(pid, "Adopted listener stopped");
        Ok(())
    }

    /// Stops the listener if it is running, then starts it again.
    ///
    /// Returns the new pid. The start path re-checks the process table, so
    /// a restart can never pile a second listener on top of a live one.
    pub async fn restart(&self) -> Result<u32> {
        match self.stop().await {
            Ok(()) => {}
            Err(SupervisorError::NotRunning) => {
                debug!("Listener was not running before restart");
            }
            Err(e) => return Err(e),
        }
        self.start().await
    }

    /// Reports the listener's current state, reconciled against the OS
    /// process table.
    ///
    /// A pid file pointing at a dead process means the listener died
    /// without a clean stop: the file is cleaned up and the state reported
    /// as crashed until the next start.
    pub async fn status(&self) -> Result<Status> {
        let mut inner = self.inner.lock().await;
        reap_exited(&mut inner);

        if let Some(child) = &inner.child {
            return Ok(Status {
                state: inner.state,
                pid: child.id(),
                uptime: inner.started_at.and_then(|t| t.elapsed().ok()),
                last_exit: inner.last_exit,
            });
        }

        match inner.pid_file.read()? {
            Some(pid) if is_alive(pid) => Ok(Status {
                state: ProcessState::Running,
                pid: Some(pid),
                uptime: process_uptime(pid),
                last_exit: inner.last_exit,
            }),
            Some(pid) => {
                warn!(pid, "Listener died without a clean stop");
                inner.pid_file.remove()?;
                inner.state = ProcessState::Crashed;
                Ok(Status {
                    state: ProcessState::Crashed,
                    pid: None,
                    uptime: None,
                    last_exit: inner.last_exit,
                })
            }
            None => Ok(Status {
                state: inner.state,
                pid: None,
                uptime: None,
                last_exit: inner.last_exit,
            }),
        }
    }

    /// Returns the last `n` captured output lines in chronological order.
    ///
    /// With [`LogSink::Capture`] this reads the in-memory ring; with
    /// [`LogSink::File`] it reads the tail of the log file. Either way the
    /// call does not block on lifecycle operations.
    pub fn tail_logs(&self, n: usize) -> Result<Vec<String>> {
        match self.sink {
            LogSink::Capture => {
                let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
                Ok(logs.tail(n))
            }
            LogSink::File => Ok(read_tail(&self.log_path(), n)?),
        }
    }

    fn open_log_file(&self) -> Result<std::fs::File> {
        std::fs::create_dir_all(&self.state_dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        Ok(file)
    }
}

/// Reaps an owned child that exited on its own and records its exit.
fn reap_exited(inner: &mut Inner) {
    let Some(child) = inner.child.as_mut() else {
        return;
    };
    match child.try_wait() {
        Ok(Some(status)) => {
            let exit = ExitKind::from_status(status);
            inner.child = None;
            if let Err(e) = inner.pid_file.remove() {
                warn!(error = %e, "Failed to remove pid file");
            }
            inner.started_at = None;
            inner.last_exit = Some(exit);
            if exit == ExitKind::Graceful {
                inner.state = ProcessState::NotRunning;
                info!("Listener exited gracefully");
            } else {
                inner.state = ProcessState::Crashed;
                warn!(%exit, "Listener exited unexpectedly");
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "Failed to poll listener exit status");
        }
    }
}

/// Sends SIGTERM (or SIGKILL with `force`) to `pid` via the `kill` binary.
///
/// A failed delivery is tolerated: it means the process is already gone,
/// which the caller confirms through the process table.
async fn send_signal(pid: u32, force: bool) -> Result<()> {
    let mut command = Command::new("kill");
    if force {
        command.arg("-9");
    }
    command
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let status = command.status().await?;
    if !status.success() {
        debug!(pid, force, "kill reported no such process");
    }
    Ok(())
}

/// Polls the process table until `pid` dies or `limit` elapses.
async fn wait_for_death(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        sleep(Duration::from_millis(LIVENESS_POLL_INTERVAL_MS)).await;
    }
    !is_alive(pid)
}

/// Copies lines from a child output stream into the shared log ring.
///
/// The first line also signals startup liveness. The task ends when the
/// stream closes, which happens when the child exits.
fn spawn_pump<R>(reader: R, logs: Arc<StdMutex<LogRing>>, first_line_tx: mpsc::Sender<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let _ = first_line_tx.try_send(());
                    logs.lock().unwrap_or_else(|e| e.into_inner()).push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read listener output");
                    break;
                }
            }
        }
    });
}
