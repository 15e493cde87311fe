//! Configuration loading for the Switchboard listener.
//!
//! The config file is the sole contract between the external configuration
//! editor and the running listener: the editor writes it, the listener reads
//! it at startup (and again on SIGHUP). TOML, human-editable:
//!
//! ```toml
//! [bot]
//! token = "..."
//! enabled = true
//!
//! [[webhook_rules]]
//! name = "all messages"
//! webhook_url = "https://example.com/hooks/everything"
//! event_type = "message"            # absent = all kinds; string or list
//! scope_type = "channel"            # absent = no scope filter
//! scope_id = "1234567890"
//! ```
//!
//! Validation happens at load: a scoped rule without a scope id, an empty
//! webhook URL, or an empty bot token reject the whole file. Unknown
//! `event_type` strings are accepted (forward compatibility) — they parse to
//! [`EventKind::Other`] and never match known gateway events.
//!
//! [`EventKind::Other`]: crate::events::EventKind::Other

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rules::{Rule, RuleSet};

/// Default config file name, resolved relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Errors raised while loading, validating, or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read at all.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not fit the schema.
    #[error("invalid config file {path}: {source}")]
    InvalidFormat {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    /// A rule failed validation.
    #[error("invalid rule \"{rule}\": {message}")]
    InvalidRule { rule: String, message: String },

    /// The bot token is absent or empty.
    #[error("bot token is empty")]
    MissingToken,

    /// The file could not be written.
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config could not be serialized back to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Bot credential block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    /// Gateway credential, handed to [`Gateway::connect`].
    ///
    /// [`Gateway::connect`]: crate::gateway::Gateway::connect
    pub token: String,

    /// When false the listener refuses to start. Checked once at startup,
    /// never polled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// The whole config file: bot credentials plus the forwarding rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub bot: BotConfig,

    /// Forwarding rules in file order.
    #[serde(default)]
    pub webhook_rules: RuleSet,
}

impl Config {
    /// Loads and validates the config file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file is missing or unreadable,
    /// [`ConfigError::InvalidFormat`] when it is not valid TOML, and
    /// [`ConfigError::InvalidRule`] / [`ConfigError::MissingToken`] when it
    /// parses but fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::InvalidFormat {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the parsed config without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: empty token, empty webhook URL, or
    /// a scoped rule missing its scope id.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        for rule in &self.webhook_rules {
            validate_rule(rule)?;
        }
        Ok(())
    }

    /// Writes the config to `path` as pretty TOML, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] or [`ConfigError::Write`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let rendered = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        std::fs::write(path, rendered).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The starter config written by `switchboard-listener init`: a
    /// placeholder token plus one match-all rule and one channel-scoped
    /// message rule to edit.
    #[must_use]
    pub fn example() -> Self {
        Self {
            bot: BotConfig {
                token: "YOUR_BOT_TOKEN_HERE".to_string(),
                enabled: true,
            },
            webhook_rules: RuleSet::new(vec![
                Rule {
                    name: "forward everything".to_string(),
                    webhook_url: "https://example.com/hooks/everything".to_string(),
                    enabled: true,
                    event_type: None,
                    scope_type: None,
                    scope_id: None,
                },
                Rule {
                    name: "channel messages".to_string(),
                    webhook_url: "https://example.com/hooks/channel".to_string(),
                    enabled: true,
                    event_type: Some(crate::rules::EventTypeFilter::One(
                        crate::events::EventKind::Message,
                    )),
                    scope_type: Some(crate::rules::ScopeType::Channel),
                    scope_id: Some("1234567890".to_string()),
                },
            ]),
        }
    }
}

/// Checks a single rule's invariants.
fn validate_rule(rule: &Rule) -> Result<(), ConfigError> {
    if rule.webhook_url.trim().is_empty() {
        return Err(ConfigError::InvalidRule {
            rule: rule.name.clone(),
            message: "webhook_url must not be empty".to_string(),
        });
    }
    if let Some(scope_type) = rule.scope_type {
        match rule.scope_id.as_deref() {
            Some(id) if !id.trim().is_empty() => {}
            _ => {
                return Err(ConfigError::InvalidRule {
                    rule: rule.name.clone(),
                    message: format!("scope_type \"{scope_type}\" requires a non-empty scope_id"),
                });
            }
        }
    }
    Ok(())
}
