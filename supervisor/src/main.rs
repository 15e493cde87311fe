//! Switchboard Supervisor CLI.
//!
//! Starts, stops, restarts and inspects a Switchboard listener process.
//! Started listeners are detached: their output goes to a log file under
//! the state directory and they keep running after this command exits.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use directories::BaseDirs;
use switchboard_supervisor::{ListenerCommand, LogSink, Status, Supervisor};
use tracing_subscriber::EnvFilter;

/// Directory name for supervisor state under the home directory.
const DEFAULT_STATE_DIR_NAME: &str = ".switchboard";

/// Listener binary resolved via PATH when none is given.
const DEFAULT_LISTENER_BIN: &str = "switchboard-listener";

/// Number of log lines shown by `logs` when `-n` is not given.
const DEFAULT_LOG_LINES: usize = 50;

#[derive(Parser)]
#[command(
    name = "switchboard-supervisor",
    about = "Manage a Switchboard listener process",
    version,
    after_help = "EXAMPLES:
    # Start the listener with the default configuration
    switchboard-supervisor start

    # Start a listener with an explicit config and feed
    switchboard-supervisor --config /etc/switchboard/config.toml \\
        --feed /var/run/switchboard/events.jsonl start

    # Inspect state and recent output
    switchboard-supervisor status
    switchboard-supervisor logs -n 100

ENVIRONMENT:
    SWITCHBOARD_STATE_DIR  Override the state directory (default: ~/.switchboard)
    RUST_LOG               Supervisor log filter (default: info)
"
)]
struct Cli {
    /// Directory for the pid file and listener log file
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Listener binary to launch
    #[arg(long, global = true, default_value = DEFAULT_LISTENER_BIN)]
    listener_bin: PathBuf,

    /// Config file passed through to the listener
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Feed file passed through to the listener
    #[arg(long, global = true)]
    feed: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the listener
    Start,
    /// Stop the running listener
    Stop,
    /// Restart the listener
    Restart,
    /// Show the listener's state
    Status,
    /// Show recent listener output
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long = "lines", default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;
    runtime.block_on(run_command(cli))
}

async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let state_dir = resolve_state_dir(cli.state_dir)?;
    let command = ListenerCommand::listener(
        cli.listener_bin,
        cli.config.as_deref(),
        cli.feed.as_deref(),
    );
    let supervisor = Supervisor::new(command, &state_dir).with_log_sink(LogSink::File);

    match cli.command {
        Command::Start => {
            let pid = supervisor.start().await?;
            println!("Listener started (pid {pid})");
            println!("Logs: {}", supervisor.log_path().display());
        }
        Command::Stop => {
            supervisor.stop().await?;
            println!("Listener stopped");
        }
        Command::Restart => {
            let pid = supervisor.restart().await?;
            println!("Listener restarted (pid {pid})");
        }
        Command::Status => {
            let status = supervisor.status().await?;
            print_status(&status);
        }
        Command::Logs { lines } => {
            for line in supervisor.tail_logs(lines)? {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// Resolves the state directory: flag, then environment, then
/// `~/.switchboard`.
fn resolve_state_dir(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    if let Ok(dir) = std::env::var("SWITCHBOARD_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let base_dirs = BaseDirs::new().context("Failed to determine home directory")?;
    Ok(base_dirs.home_dir().join(DEFAULT_STATE_DIR_NAME))
}

fn print_status(status: &Status) {
    println!("State:     {}", status.state);
    match status.pid {
        Some(pid) => println!("PID:       {pid}"),
        None => println!("PID:       -"),
    }
    match status.uptime {
        Some(uptime) => println!("Uptime:    {}", format_duration(uptime)),
        None => println!("Uptime:    -"),
    }
    match status.last_exit {
        Some(exit) => println!("Last exit: {exit}"),
        None => println!("Last exit: -"),
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}
