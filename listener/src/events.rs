//! Event types for the Switchboard listener.
//!
//! This module defines the normalized event shape the forwarding engine
//! operates on, plus the raw wire shape produced by a gateway. Raw events
//! arrive as a type tag and an opaque JSON object; normalization assigns an
//! id and a timestamp, parses the tag into an [`EventKind`], and lifts the
//! scope identifiers (`guild_id`, `channel_id`) out of the payload so rules
//! can match on them without touching payload contents.
//!
//! The payload itself stays an opaque map — it is used only when rendering a
//! webhook delivery, never for matching.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Length of the random alphanumeric suffix in event IDs.
const EVENT_ID_SUFFIX_LEN: usize = 20;

/// Prefix for all event IDs.
const EVENT_ID_PREFIX: &str = "evt_";

/// Maximum length of a rendered summary line.
const SUMMARY_MAX_LEN: usize = 256;

/// Classification of a platform event.
///
/// The set of known kinds mirrors what the gateway emits today. Tags the
/// listener has never heard of are preserved verbatim in [`EventKind::Other`]
/// so new platform event types flow through rules (and renderers) without a
/// code change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Message,
    MemberJoin,
    MemberRemove,
    ReactionAdd,
    ChannelCreate,
    ChannelDelete,
    /// An event type this build does not know about.
    Other(String),
}

impl EventKind {
    /// Returns the wire-format tag for this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Message => "message",
            EventKind::MemberJoin => "member_join",
            EventKind::MemberRemove => "member_remove",
            EventKind::ReactionAdd => "reaction_add",
            EventKind::ChannelCreate => "channel_create",
            EventKind::ChannelDelete => "channel_delete",
            EventKind::Other(tag) => tag,
        }
    }
}

impl From<&str> for EventKind {
    fn from(tag: &str) -> Self {
        match tag {
            "message" => EventKind::Message,
            "member_join" => EventKind::MemberJoin,
            "member_remove" => EventKind::MemberRemove,
            "reaction_add" => EventKind::ReactionAdd,
            "channel_create" => EventKind::ChannelCreate,
            "channel_delete" => EventKind::ChannelDelete,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        EventKind::from(tag.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A platform event as it arrives from a gateway, before normalization.
///
/// The feed gateway deserializes one of these per JSON line; other gateway
/// implementations construct them directly from their client callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Wire-format event tag, e.g. `"message"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Event-specific fields, passed through opaquely.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// A normalized platform event.
///
/// Constructed once per gateway callback, immutable thereafter, and discarded
/// after dispatch completes. Events are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier with format `evt_` followed by 20 alphanumeric
    /// characters. Used only for log correlation.
    pub id: String,

    /// Classification of the event.
    pub kind: EventKind,

    /// Guild the event occurred in, when the payload carries one.
    pub guild_id: Option<String>,

    /// Channel the event occurred in, when the payload carries one.
    pub channel_id: Option<String>,

    /// When the event was normalized.
    pub timestamp: DateTime<Utc>,

    /// Event-specific fields, used only for rendering.
    pub payload: Map<String, Value>,
}

impl Event {
    /// Normalizes a raw gateway event.
    ///
    /// Scope identifiers are lifted out of the payload: a `guild_id` or
    /// `channel_id` field that is a non-empty string or a number becomes the
    /// event's scope id (numbers are stringified); `null`, empty, or missing
    /// fields leave the scope absent.
    ///
    /// # Examples
    ///
    /// ```
    /// use switchboard_listener::events::{Event, EventKind, RawEvent};
    ///
    /// let raw: RawEvent = serde_json::from_str(
    ///     r#"{"type": "message", "data": {"guild_id": 42, "content": "hi"}}"#,
    /// )
    /// .unwrap();
    /// let event = Event::from_raw(raw);
    ///
    /// assert_eq!(event.kind, EventKind::Message);
    /// assert_eq!(event.guild_id.as_deref(), Some("42"));
    /// assert!(event.channel_id.is_none());
    /// assert!(event.id.starts_with("evt_"));
    /// ```
    #[must_use]
    pub fn from_raw(raw: RawEvent) -> Self {
        let guild_id = scope_id_field(&raw.data, "guild_id");
        let channel_id = scope_id_field(&raw.data, "channel_id");

        Self {
            id: generate_event_id(),
            kind: EventKind::from(raw.kind),
            guild_id,
            channel_id,
            timestamp: Utc::now(),
            payload: raw.data,
        }
    }

    /// Renders a one-line human-readable summary of this event.
    ///
    /// Known kinds compose well-known payload fields (`author`, `content`,
    /// `member`, `guild`, and friends); anything else falls back to the kind
    /// tag. The result is truncated to a bounded length so a pathological
    /// payload cannot bloat the delivery.
    #[must_use]
    pub fn summary(&self) -> String {
        let text = match &self.kind {
            EventKind::Message => match (self.field("author"), self.field("content")) {
                (Some(author), Some(content)) => format!("{author}: {content}"),
                (Some(author), None) => format!("{author} sent a message"),
                _ => fallback(&self.kind),
            },
            EventKind::MemberJoin => match (self.field("member"), self.field("guild")) {
                (Some(member), Some(guild)) => format!("{member} joined {guild}"),
                (Some(member), None) => format!("{member} joined"),
                _ => fallback(&self.kind),
            },
            EventKind::MemberRemove => match (self.field("member"), self.field("guild")) {
                (Some(member), Some(guild)) => format!("{member} left {guild}"),
                (Some(member), None) => format!("{member} left"),
                _ => fallback(&self.kind),
            },
            EventKind::ReactionAdd => match (self.field("user"), self.field("emoji")) {
                (Some(user), Some(emoji)) => format!("{user} reacted with {emoji}"),
                _ => fallback(&self.kind),
            },
            EventKind::ChannelCreate => match self.field("channel") {
                Some(channel) => format!("channel {channel} created"),
                None => fallback(&self.kind),
            },
            EventKind::ChannelDelete => match self.field("channel") {
                Some(channel) => format!("channel {channel} deleted"),
                None => fallback(&self.kind),
            },
            EventKind::Other(_) => fallback(&self.kind),
        };

        truncate(text, SUMMARY_MAX_LEN)
    }

    /// Returns a payload field rendered as text, if present and non-null.
    fn field(&self, key: &str) -> Option<String> {
        match self.payload.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Fallback summary when the well-known fields are absent.
fn fallback(kind: &EventKind) -> String {
    format!("{kind} event")
}

/// Truncates `text` to at most `max` bytes on a char boundary, appending an
/// ellipsis when anything was cut.
fn truncate(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max.saturating_sub(3);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Extracts a scope identifier from a raw payload field.
///
/// Numbers are stringified (gateways emit snowflakes as integers); `null`
/// and empty strings count as absent.
fn scope_id_field(data: &Map<String, Value>, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Generates a unique event ID with the format `evt_` followed by 20
/// alphanumeric characters.
fn generate_event_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    let mut rng = rand::rng();
    let suffix: String = (0..EVENT_ID_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();

    format!("{EVENT_ID_PREFIX}{suffix}")
}
