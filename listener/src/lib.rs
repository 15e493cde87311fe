//! Switchboard listener - chat platform event forwarder.
//!
//! This crate connects to a chat platform gateway, matches incoming events
//! against operator-configured forwarding rules, and posts matching events to
//! webhook endpoints as JSON.
//!
//! # Overview
//!
//! A TOML configuration file declares the bot credential and a list of
//! webhook rules. Each rule names an endpoint and optionally constrains which
//! event types it wants and which guild or channel it listens to. At runtime
//! the listener pulls events off the gateway, fans each one out to every
//! matching rule concurrently, and retries transient delivery failures with
//! exponential backoff. Rule processing is isolated: one unreachable endpoint
//! never blocks deliveries to the others.
//!
//! # Modules
//!
//! - [`events`]: Platform event model and webhook summaries
//! - [`rules`]: Webhook rules and matching
//! - [`config`]: TOML configuration loading and validation
//! - [`dispatch`]: Webhook delivery with retry and bounded fan-out
//! - [`gateway`]: Gateway seam and the bundled feed gateway
//! - [`listener`]: Connection lifecycle and event intake
//! - [`error`]: Top-level errors and process exit codes

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod listener;
pub mod rules;

pub use config::{BotConfig, Config, ConfigError};
pub use dispatch::{DispatchError, DispatchOutcome, Dispatcher, RetryPolicy};
pub use error::{ListenerError, Result};
pub use events::{Event, EventKind, RawEvent};
pub use gateway::{EventSource, FeedGateway, Gateway, GatewayError};
pub use listener::{Control, Listener, ListenerState, ReconnectPolicy};
pub use rules::{EventTypeFilter, Rule, RuleSet, ScopeType};
