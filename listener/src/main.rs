//! Switchboard listener - chat platform event forwarder.
//!
//! This binary connects to the platform gateway, matches incoming events
//! against configured webhook rules, and forwards matches as JSON POSTs.
//!
//! # Commands
//!
//! - `switchboard-listener init`: Write an example configuration file
//! - `switchboard-listener check`: Validate the configuration and exit
//! - `switchboard-listener test-webhook <URL>`: Probe a webhook endpoint
//! - `switchboard-listener run`: Start forwarding events
//!
//! Exit codes distinguish why the listener stopped: `0` graceful shutdown,
//! `2` configuration rejected (including a disabled bot), `3` authentication
//! failure, `4` connection retries exhausted.

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use switchboard_listener::config::{Config, DEFAULT_CONFIG_PATH};
use switchboard_listener::dispatch::{Dispatcher, RetryPolicy};
use switchboard_listener::error::{
    ListenerError, EXIT_CONFIG_REJECTED, EXIT_FAILURE, EXIT_SUCCESS,
};
use switchboard_listener::gateway::FeedGateway;
use switchboard_listener::listener::{Control, Listener};

/// Default path of the JSON-lines event feed.
const DEFAULT_FEED_PATH: &str = "events.jsonl";

/// Switchboard listener - chat platform event forwarder.
///
/// Watches the platform event stream and posts matching events to the
/// webhook endpoints declared in the configuration file.
#[derive(Parser, Debug)]
#[command(name = "switchboard-listener")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
EXAMPLES:
    # Write an example configuration
    switchboard-listener init

    # Validate the configuration
    switchboard-listener check

    # Verify a webhook endpoint accepts deliveries
    switchboard-listener test-webhook https://hooks.example.com/abc

    # Start forwarding events
    switchboard-listener run --feed /var/run/switchboard/events.jsonl

SIGNALS:
    SIGHUP     Reload webhook rules from the configuration file
    SIGTERM    Graceful shutdown, draining in-flight deliveries

ENVIRONMENT VARIABLES:
    RUST_LOG   Log filter (default: info)
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Write an example configuration file.
    ///
    /// The file contains a placeholder token and two sample rules; edit it
    /// before starting the listener.
    Init {
        /// Path to write the configuration to.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Overwrite an existing file without confirmation.
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration file and exit.
    ///
    /// Exits 0 when the file parses and every rule passes validation,
    /// 2 otherwise.
    Check {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Send a test payload to a webhook endpoint.
    TestWebhook {
        /// Endpoint URL to probe.
        url: String,
    },

    /// Start the listener.
    ///
    /// Connects to the platform gateway and forwards matching events until
    /// stopped.
    Run {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Path of the JSON-lines event feed to tail.
        #[arg(short, long, default_value = DEFAULT_FEED_PATH)]
        feed: PathBuf,

        /// Directory for daily-rolling log files (stderr when unset).
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Init { config, force } => run_init(&config, force),
        Command::Check { config } => run_check(&config),
        Command::TestWebhook { url } => block_on(run_test_webhook(url)),
        Command::Run {
            config,
            feed,
            log_dir,
        } => block_on(run_listener(config, feed, log_dir)),
    };

    std::process::exit(exit_code);
}

/// Builds the async runtime and drives `future` to completion.
fn block_on<F: Future<Output = i32>>(future: F) -> i32 {
    match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(future),
        Err(e) => {
            eprintln!("Error: failed to create async runtime: {e}");
            EXIT_FAILURE
        }
    }
}

/// Runs the init command, writing an example configuration.
fn run_init(config_path: &Path, force: bool) -> i32 {
    if config_path.exists() && !force {
        eprintln!("Configuration already exists at: {}", config_path.display());
        eprintln!();
        eprint!("Overwrite it? [y/N] ");
        if io::stderr().flush().is_err() {
            return EXIT_FAILURE;
        }

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            return EXIT_FAILURE;
        }

        if !input.trim().eq_ignore_ascii_case("y") {
            eprintln!("Aborted.");
            return EXIT_SUCCESS;
        }
    }

    match Config::example().save(config_path) {
        Ok(()) => {
            println!(
                "Example configuration written to: {}",
                config_path.display()
            );
            println!();
            println!("Edit the [bot] token, then start the listener:");
            println!();
            println!("  switchboard-listener run --config {}", config_path.display());
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            EXIT_FAILURE
        }
    }
}

/// Runs the check command, validating the configuration file.
fn run_check(config_path: &Path) -> i32 {
    match Config::load(config_path) {
        Ok(config) => {
            println!("Configuration OK: {}", config_path.display());
            println!(
                "  bot: {}",
                if config.bot.enabled { "enabled" } else { "disabled" }
            );
            println!(
                "  rules: {} ({} enabled)",
                config.webhook_rules.len(),
                config.webhook_rules.enabled_count()
            );
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            EXIT_CONFIG_REJECTED
        }
    }
}

/// Runs the test-webhook command, probing a single endpoint.
async fn run_test_webhook(url: String) -> i32 {
    let dispatcher = Dispatcher::new(RetryPolicy::default());
    match dispatcher.send_test(&url).await {
        Ok(()) => {
            println!("Webhook accepted the test payload: {url}");
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            EXIT_FAILURE
        }
    }
}

/// Runs the listener daemon.
async fn run_listener(config_path: PathBuf, feed: PathBuf, log_dir: Option<PathBuf>) -> i32 {
    let _guard = init_logging(log_dir.as_deref());

    info!("Starting Switchboard listener");

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(
                error = %e,
                config = %config_path.display(),
                "Failed to load configuration"
            );
            eprintln!("Error: {e}");
            return ListenerError::from(e).exit_code();
        }
    };

    info!(
        config = %config_path.display(),
        feed = %feed.display(),
        rules = config.webhook_rules.len(),
        enabled_rules = config.webhook_rules.enabled_count(),
        "Configuration loaded"
    );

    let gateway = Arc::new(FeedGateway::new(feed));
    let dispatcher = Arc::new(Dispatcher::new(RetryPolicy::default()));
    let mut listener = Listener::new(config, config_path, gateway, dispatcher);

    let (control_tx, mut control_rx) = mpsc::channel(4);
    tokio::spawn(forward_signals(control_tx));

    match listener.run(&mut control_rx).await {
        Ok(()) => {
            info!("Listener stopped");
            EXIT_SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Listener stopped with error");
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

/// Initializes the logging subsystem.
///
/// With a log directory, output goes to a daily-rolling file through a
/// non-blocking writer; the returned guard must stay alive so buffered lines
/// are flushed on exit.
fn init_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "switchboard-listener.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_level(true)
                .init();
            None
        }
    }
}

/// Forwards process signals to the listener's control channel.
///
/// SIGHUP becomes a reload, SIGINT/SIGTERM become a shutdown. All three
/// streams are installed once, before the loop, so a signal arriving while
/// an earlier one is being forwarded stays pending rather than lost.
async fn forward_signals(control_tx: mpsc::Sender<Control>) {
    #[cfg(unix)]
    {
        let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");
        let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("Shutdown signal received");
                    let _ = control_tx.send(Control::Shutdown).await;
                    break;
                }
                _ = terminate.recv() => {
                    info!("Shutdown signal received");
                    let _ = control_tx.send(Control::Shutdown).await;
                    break;
                }
                _ = hangup.recv() => {
                    info!("Reload signal received");
                    let _ = control_tx.send(Control::Reload).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
        let _ = control_tx.send(Control::Shutdown).await;
    }
}
