//! Event listener core: gateway lifecycle, rule matching, and dispatch fan-out.
//!
//! [`Listener::run`] owns the connection loop. It connects through the
//! [`Gateway`](crate::gateway::Gateway) seam, pulls raw events off the
//! session, matches each one against the current rule snapshot in arrival
//! order, and hands every match set to the
//! [`Dispatcher`](crate::dispatch::Dispatcher) on a background task so slow
//! webhooks never stall intake.
//!
//! Connection drops reconnect with jittered exponential backoff; the backoff
//! resets on every successful session. Repeated consecutive connection
//! failures give up with [`ListenerError::ConnectionExhausted`], and a
//! credential rejection aborts immediately with
//! [`ListenerError::AuthRejected`] so the operator fixes the token instead of
//! watching a retry loop.
//!
//! Control arrives on a channel: [`Control::Reload`] re-reads the
//! configuration file and swaps the rule snapshot (keeping the old one if the
//! new file is invalid), [`Control::Shutdown`] stops intake and drains
//! in-flight deliveries within a grace window.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use switchboard_listener::config::Config;
//! use switchboard_listener::dispatch::{Dispatcher, RetryPolicy};
//! use switchboard_listener::gateway::FeedGateway;
//! use switchboard_listener::listener::Listener;
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.toml")?;
//! let gateway = Arc::new(FeedGateway::new("events.jsonl"));
//! let dispatcher = Arc::new(Dispatcher::new(RetryPolicy::default()));
//!
//! let (_control_tx, mut control_rx) = mpsc::channel(4);
//! let mut listener = Listener::new(
//!     config,
//!     PathBuf::from("config.toml"),
//!     gateway,
//!     dispatcher,
//! );
//! listener.run(&mut control_rx).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::ListenerError;
use crate::events::{Event, RawEvent};
use crate::gateway::{EventSource, Gateway, GatewayError};
use crate::rules::{Rule, RuleSet};

/// Delay before the first reconnection attempt.
const INITIAL_RECONNECT_DELAY_SECS: u64 = 1;

/// Ceiling for the reconnect backoff.
const MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// Fractional jitter applied to reconnect delays (±25%).
const RECONNECT_JITTER: f64 = 0.25;

/// Consecutive connection failures tolerated before giving up.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Upper bound on dispatch tasks in flight at once. Intake waits for a slot
/// instead of growing without limit when every webhook is slow.
const MAX_IN_FLIGHT_DISPATCHES: usize = 64;

/// How long shutdown waits for in-flight deliveries before abandoning them.
const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// No session and none being established.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Live session; events are flowing.
    Connected,
    /// Session lost; waiting out the backoff before the next attempt.
    Reconnecting,
    /// Shutdown requested; draining in-flight deliveries.
    ShuttingDown,
}

impl ListenerState {
    /// The state's wire/log name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime control signals, normally wired to process signals by the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Re-read the configuration file and swap the rule snapshot.
    Reload,
    /// Stop intake, drain deliveries, and return.
    Shutdown,
}

/// Reconnection backoff tuning.
///
/// Delays double per consecutive failure up to the ceiling, with ± jitter so
/// restarted listeners do not reconnect in lockstep. Tests swap in
/// [`ReconnectPolicy::fast_for_tests`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the doubled delay.
    pub max_delay: Duration,

    /// Fractional jitter applied to every wait (±).
    pub jitter: f64,

    /// Consecutive failures tolerated before the listener gives up.
    pub max_consecutive_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(INITIAL_RECONNECT_DELAY_SECS),
            max_delay: Duration::from_secs(MAX_RECONNECT_DELAY_SECS),
            jitter: RECONNECT_JITTER,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl ReconnectPolicy {
    /// A policy with millisecond delays for integration tests.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            jitter: RECONNECT_JITTER,
            max_consecutive_failures: 3,
        }
    }

    /// Adds ± `jitter` to a duration.
    fn jittered(&self, duration: Duration) -> Duration {
        let mut rng = rand::rng();
        let jitter_range = duration.as_secs_f64() * self.jitter;
        let jitter = rng.random_range(-jitter_range..=jitter_range);
        let new_secs = (duration.as_secs_f64() + jitter).max(0.001);
        Duration::from_secs_f64(new_secs)
    }

    /// Doubles the delay up to the maximum.
    fn increased(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.max_delay)
    }
}

/// How a live session ended, decided by the intake loop.
enum SessionEnd {
    /// The stream closed or errored; reconnect.
    Dropped(String),
    /// Shutdown was requested.
    Shutdown,
    /// Unrecoverable; drain and return the error.
    Fatal(ListenerError),
}

/// The event listener.
///
/// Holds the gateway seam, the shared dispatcher, and the current rule
/// snapshot. Everything interesting happens in [`Listener::run`].
pub struct Listener {
    config_path: PathBuf,
    gateway: Arc<dyn Gateway>,
    dispatcher: Arc<Dispatcher>,
    rules: Arc<RuleSet>,
    token: String,
    enabled: bool,
    state: ListenerState,
    reconnect: ReconnectPolicy,
}

impl Listener {
    /// Creates a listener from a validated configuration.
    ///
    /// `config_path` is kept for reloads.
    #[must_use]
    pub fn new(
        config: Config,
        config_path: PathBuf,
        gateway: Arc<dyn Gateway>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            config_path,
            gateway,
            dispatcher,
            rules: Arc::new(config.webhook_rules),
            token: config.bot.token,
            enabled: config.bot.enabled,
            state: ListenerState::Disconnected,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Overrides the reconnection backoff.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// The rule snapshot events are currently matched against.
    #[must_use]
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Runs the listener until shutdown or a fatal error.
    ///
    /// Returns `Ok(())` after a graceful shutdown. Fatal outcomes are
    /// [`ListenerError::BotDisabled`] (refused to start),
    /// [`ListenerError::AuthRejected`], and
    /// [`ListenerError::ConnectionExhausted`]. In-flight deliveries are
    /// drained within the grace window on every exit path.
    pub async fn run(
        &mut self,
        control_rx: &mut mpsc::Receiver<Control>,
    ) -> Result<(), ListenerError> {
        if !self.enabled {
            info!("Bot is disabled in configuration, not starting");
            return Err(ListenerError::BotDisabled);
        }

        let mut in_flight = JoinSet::new();
        let result = self.run_sessions(control_rx, &mut in_flight).await;

        self.set_state(ListenerState::ShuttingDown);
        self.drain(in_flight).await;
        self.set_state(ListenerState::Disconnected);

        result
    }

    /// Connect/intake loop. Returns `Ok(())` when shutdown was requested.
    async fn run_sessions(
        &mut self,
        control_rx: &mut mpsc::Receiver<Control>,
        in_flight: &mut JoinSet<()>,
    ) -> Result<(), ListenerError> {
        let mut delay = self.reconnect.initial_delay;
        let mut consecutive_failures: u32 = 0;
        // True once a connection has been lost or refused, so later attempts
        // show up as reconnecting rather than connecting.
        let mut reconnecting = false;

        loop {
            self.set_state(if reconnecting {
                ListenerState::Reconnecting
            } else {
                ListenerState::Connecting
            });

            let connected = tokio::select! {
                result = self.gateway.connect(&self.token) => result,
                signal = control_rx.recv() => match signal {
                    Some(Control::Reload) => {
                        self.reload();
                        continue;
                    }
                    Some(Control::Shutdown) | None => return Ok(()),
                },
            };

            let source = match connected {
                Ok(source) => source,
                Err(GatewayError::Auth(message)) => {
                    error!(error = %message, "Gateway rejected the bot token");
                    return Err(ListenerError::AuthRejected { message });
                }
                Err(GatewayError::Connection(message)) => {
                    reconnecting = true;
                    consecutive_failures += 1;
                    if consecutive_failures >= self.reconnect.max_consecutive_failures {
                        error!(
                            failures = consecutive_failures,
                            "Giving up after repeated connection failures"
                        );
                        return Err(ListenerError::ConnectionExhausted {
                            attempts: consecutive_failures,
                        });
                    }

                    let wait = self.reconnect.jittered(delay);
                    warn!(
                        error = %message,
                        failures = consecutive_failures,
                        delay_ms = wait.as_millis() as u64,
                        "Connection failed, retrying"
                    );
                    delay = self.reconnect.increased(delay);
                    if !self.wait_or_shutdown(wait, control_rx).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            // Successful session: backoff starts over.
            consecutive_failures = 0;
            delay = self.reconnect.initial_delay;
            self.set_state(ListenerState::Connected);
            info!(
                rules = self.rules.len(),
                enabled_rules = self.rules.enabled_count(),
                "Gateway session established"
            );

            match self.intake(source, control_rx, in_flight).await {
                SessionEnd::Dropped(reason) => {
                    warn!(reason = %reason, "Gateway session ended, reconnecting");
                    reconnecting = true;
                    self.set_state(ListenerState::Reconnecting);
                    // Brief pause so an immediately-dropping session cannot
                    // hot-loop, without counting against the failure budget.
                    let wait = self.reconnect.jittered(self.reconnect.initial_delay);
                    if !self.wait_or_shutdown(wait, control_rx).await {
                        return Ok(());
                    }
                }
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Fatal(e) => return Err(e),
            }
        }
    }

    /// Pulls events off a live session until it ends.
    async fn intake(
        &mut self,
        mut source: Box<dyn EventSource>,
        control_rx: &mut mpsc::Receiver<Control>,
        in_flight: &mut JoinSet<()>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                event = source.next_event() => match event {
                    Ok(Some(raw)) => self.handle_event(raw, in_flight).await,
                    Ok(None) => return SessionEnd::Dropped("stream closed".to_string()),
                    Err(GatewayError::Auth(message)) => {
                        error!(error = %message, "Gateway revoked authentication");
                        return SessionEnd::Fatal(ListenerError::AuthRejected { message });
                    }
                    Err(GatewayError::Connection(message)) => {
                        return SessionEnd::Dropped(message);
                    }
                },

                signal = control_rx.recv() => match signal {
                    Some(Control::Reload) => self.reload(),
                    Some(Control::Shutdown) | None => return SessionEnd::Shutdown,
                },

                // Reap finished dispatch tasks so the set stays small.
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }
    }

    /// Matches one raw event and spawns the dispatch fan-out for it.
    ///
    /// Matching runs inline so events are matched in arrival order; only the
    /// HTTP work moves to a task. When the in-flight bound is reached, intake
    /// waits for a slot rather than queueing without limit.
    async fn handle_event(&self, raw: RawEvent, in_flight: &mut JoinSet<()>) {
        let event = Event::from_raw(raw);
        let matched: Vec<Rule> = self
            .rules
            .matching(&event)
            .into_iter()
            .cloned()
            .collect();

        if matched.is_empty() {
            trace!(event_id = %event.id, kind = %event.kind, "No matching rules");
            return;
        }

        debug!(
            event_id = %event.id,
            kind = %event.kind,
            matched = matched.len(),
            "Dispatching event"
        );

        while in_flight.len() >= MAX_IN_FLIGHT_DISPATCHES {
            let _ = in_flight.join_next().await;
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        in_flight.spawn(async move {
            let refs: Vec<&Rule> = matched.iter().collect();
            let outcomes = dispatcher.dispatch_all(&event, &refs).await;
            let failed = outcomes.iter().filter(|o| !o.delivered()).count();
            if failed > 0 {
                debug!(
                    event_id = %event.id,
                    failed,
                    total = outcomes.len(),
                    "Dispatch fan-out finished with failures"
                );
            }
        });
    }

    /// Re-reads the configuration file and swaps the rule snapshot.
    ///
    /// An invalid file leaves the previous snapshot in place. Deliveries
    /// already in flight are unaffected either way.
    fn reload(&mut self) {
        info!(config = %self.config_path.display(), "Reloading configuration");
        match Config::load(&self.config_path) {
            Ok(config) => {
                if !config.bot.enabled {
                    warn!("Configuration now disables the bot; takes effect on restart");
                }
                if config.bot.token != self.token {
                    info!("Bot token changed; applies on the next reconnect");
                    self.token = config.bot.token;
                }
                let rules = Arc::new(config.webhook_rules);
                info!(
                    rules = rules.len(),
                    enabled_rules = rules.enabled_count(),
                    "Rule snapshot swapped"
                );
                self.rules = rules;
            }
            Err(e) => {
                error!(error = %e, "Reload failed, keeping previous configuration");
            }
        }
    }

    /// Sleeps for `wait` unless shutdown arrives first.
    ///
    /// Reloads are still honored during the wait. Returns `false` when
    /// shutdown was requested.
    async fn wait_or_shutdown(
        &mut self,
        wait: Duration,
        control_rx: &mut mpsc::Receiver<Control>,
    ) -> bool {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                signal = control_rx.recv() => match signal {
                    Some(Control::Reload) => self.reload(),
                    Some(Control::Shutdown) | None => return false,
                },
            }
        }
    }

    /// Waits for in-flight deliveries, abandoning whatever outlives the
    /// grace window.
    async fn drain(&mut self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        info!(pending = in_flight.len(), "Draining in-flight deliveries");
        let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
        let drained = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "Grace period expired, abandoning deliveries"
            );
            in_flight.abort_all();
        }
    }

    fn set_state(&mut self, next: ListenerState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Listener state changed");
            self.state = next;
        }
    }
}
