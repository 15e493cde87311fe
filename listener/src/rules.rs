//! Forwarding rules and the rule matcher.
//!
//! A [`Rule`] pairs event criteria (type constraint + optional scope) with a
//! destination webhook URL. A [`RuleSet`] is an ordered collection of rules;
//! [`RuleSet::matching`] is the matcher: a pure function from an event to the
//! ordered list of rules it satisfies. Matching is fan-out, not
//! first-match-wins — one event may trigger any number of webhooks.
//!
//! Rules arrive from the config file and are held by the listener as an
//! immutable snapshot; reload builds a whole new `RuleSet` and swaps the
//! reference, never mutating rules in place.
//!
//! # Example
//!
//! ```rust
//! use switchboard_listener::events::{Event, RawEvent};
//! use switchboard_listener::rules::{Rule, RuleSet};
//!
//! let toml = r#"
//!     name = "announcements"
//!     webhook_url = "https://example.com/hook"
//!     event_type = "message"
//!     scope_type = "channel"
//!     scope_id = "42"
//! "#;
//! let rule: Rule = toml::from_str(toml).unwrap();
//! let rules = RuleSet::new(vec![rule]);
//!
//! let raw: RawEvent = serde_json::from_str(
//!     r#"{"type": "message", "data": {"channel_id": "42"}}"#,
//! )
//! .unwrap();
//! let event = Event::from_raw(raw);
//!
//! assert_eq!(rules.matching(&event).len(), 1);
//! ```

use serde::{Deserialize, Serialize};

use crate::events::{Event, EventKind};

/// Which scope dimension a rule is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Guild,
    Channel,
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeType::Guild => f.write_str("guild"),
            ScopeType::Channel => f.write_str("channel"),
        }
    }
}

/// Event-type constraint of a rule: a single kind or a set of kinds.
///
/// Absent entirely (the `Option` around this in [`Rule`]) means "match every
/// kind". Unknown kind strings are accepted — they parse to
/// [`EventKind::Other`] and simply never match known gateway events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTypeFilter {
    One(EventKind),
    Many(Vec<EventKind>),
}

impl EventTypeFilter {
    /// Whether `kind` satisfies this constraint.
    fn allows(&self, kind: &EventKind) -> bool {
        match self {
            EventTypeFilter::One(want) => want == kind,
            EventTypeFilter::Many(wants) => wants.contains(kind),
        }
    }
}

/// A forwarding directive: event criteria plus a destination webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Human label. Not enforced unique, but should be for log clarity.
    pub name: String,

    /// Destination HTTP endpoint. Required non-empty (enforced at load).
    pub webhook_url: String,

    /// Disabled rules are loaded but never matched.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Event-type constraint; absent means match all kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventTypeFilter>,

    /// Scope dimension; absent means no scope filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_type: Option<ScopeType>,

    /// Scope identifier; required whenever `scope_type` is set (enforced at
    /// load).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Whether this rule matches `event`.
    ///
    /// Disabled rules never match. A guild-scoped rule requires the event to
    /// carry an equal `guild_id`; a channel-scoped rule requires an equal
    /// `channel_id`. A scoped rule therefore never matches an event lacking
    /// that identifier. Total: never panics, even on a malformed rule that
    /// slipped past load-time validation (a scoped rule without a scope id
    /// matches nothing).
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if !self.enabled {
            return false;
        }
        self.allows_kind(&event.kind) && self.allows_scope(event)
    }

    fn allows_kind(&self, kind: &EventKind) -> bool {
        match &self.event_type {
            None => true,
            Some(filter) => filter.allows(kind),
        }
    }

    fn allows_scope(&self, event: &Event) -> bool {
        let event_id = match self.scope_type {
            None => return true,
            Some(ScopeType::Guild) => event.guild_id.as_deref(),
            Some(ScopeType::Channel) => event.channel_id.as_deref(),
        };
        match (self.scope_id.as_deref(), event_id) {
            (Some(want), Some(have)) => want == have,
            _ => false,
        }
    }
}

/// Ordered collection of rules, insertion order preserved.
///
/// Order affects dispatch order but not outcome, since matching is fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Creates a rule set preserving the given order.
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// The matcher: returns every enabled rule `event` satisfies, in rule-set
    /// order.
    ///
    /// Pure and deterministic — same event and rule set always yield the same
    /// ordered result.
    #[must_use]
    pub fn matching(&self, event: &Event) -> Vec<&Rule> {
        self.rules.iter().filter(|rule| rule.matches(event)).collect()
    }

    /// Number of rules, enabled or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set holds no rules at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of enabled rules.
    #[must_use]
    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|rule| rule.enabled).count()
    }

    /// Iterates over all rules in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RawEvent;
    use serde_json::json;

    /// Helper to build a normalized event with the given scope ids.
    fn make_event(kind: &str, guild_id: Option<&str>, channel_id: Option<&str>) -> Event {
        let mut data = serde_json::Map::new();
        if let Some(id) = guild_id {
            data.insert("guild_id".to_string(), json!(id));
        }
        if let Some(id) = channel_id {
            data.insert("channel_id".to_string(), json!(id));
        }
        Event::from_raw(RawEvent {
            kind: kind.to_string(),
            data,
        })
    }

    /// Helper for an unconstrained rule forwarding to `url`.
    fn make_rule(name: &str, url: &str) -> Rule {
        Rule {
            name: name.to_string(),
            webhook_url: url.to_string(),
            enabled: true,
            event_type: None,
            scope_type: None,
            scope_id: None,
        }
    }

    #[test]
    fn unconstrained_rule_matches_everything() {
        let rule = make_rule("all", "https://example.com/a");

        assert!(rule.matches(&make_event("message", Some("1"), Some("2"))));
        assert!(rule.matches(&make_event("member_join", Some("1"), None)));
        assert!(rule.matches(&make_event("custom_kind", None, None)));
    }

    #[test]
    fn disabled_rule_never_matches() {
        let mut rule = make_rule("off", "https://example.com/a");
        rule.enabled = false;

        assert!(!rule.matches(&make_event("message", Some("1"), Some("2"))));
    }

    #[test]
    fn single_event_type_must_equal() {
        let mut rule = make_rule("messages", "https://example.com/a");
        rule.event_type = Some(EventTypeFilter::One(EventKind::Message));

        assert!(rule.matches(&make_event("message", None, None)));
        assert!(!rule.matches(&make_event("member_join", None, None)));
    }

    #[test]
    fn event_type_set_is_membership() {
        let mut rule = make_rule("members", "https://example.com/a");
        rule.event_type = Some(EventTypeFilter::Many(vec![
            EventKind::MemberJoin,
            EventKind::MemberRemove,
        ]));

        assert!(rule.matches(&make_event("member_join", None, None)));
        assert!(rule.matches(&make_event("member_remove", None, None)));
        assert!(!rule.matches(&make_event("message", None, None)));
    }

    #[test]
    fn unknown_event_type_never_matches_known_events() {
        let mut rule = make_rule("future", "https://example.com/a");
        rule.event_type = Some(EventTypeFilter::One(EventKind::Other(
            "voice_state_update".to_string(),
        )));

        assert!(!rule.matches(&make_event("message", None, None)));
        // ...but does match the same unknown tag coming off the gateway.
        assert!(rule.matches(&make_event("voice_state_update", None, None)));
    }

    #[test]
    fn guild_scope_requires_equal_guild_id() {
        let mut rule = make_rule("one-guild", "https://example.com/a");
        rule.scope_type = Some(ScopeType::Guild);
        rule.scope_id = Some("123".to_string());

        assert!(rule.matches(&make_event("message", Some("123"), Some("456"))));
        assert!(!rule.matches(&make_event("message", Some("999"), Some("456"))));
        assert!(!rule.matches(&make_event("message", None, Some("456"))));
    }

    #[test]
    fn channel_scope_requires_equal_channel_id() {
        let mut rule = make_rule("one-channel", "https://example.com/a");
        rule.scope_type = Some(ScopeType::Channel);
        rule.scope_id = Some("456".to_string());

        assert!(rule.matches(&make_event("message", Some("1"), Some("456"))));
        assert!(!rule.matches(&make_event("message", Some("1"), Some("789"))));
        // A channel-scoped rule must not match events lacking a channel id.
        assert!(!rule.matches(&make_event("member_join", Some("1"), None)));
    }

    #[test]
    fn scoped_rule_without_id_matches_nothing() {
        // Load-time validation rejects this shape; the matcher still has to
        // stay total if it ever sees one.
        let mut rule = make_rule("broken", "https://example.com/a");
        rule.scope_type = Some(ScopeType::Guild);
        rule.scope_id = None;

        assert!(!rule.matches(&make_event("message", Some("1"), None)));
        assert!(!rule.matches(&make_event("message", None, None)));
    }

    #[test]
    fn matching_returns_all_matches_in_order() {
        let mut only_joins = make_rule("joins", "https://example.com/b");
        only_joins.event_type = Some(EventTypeFilter::One(EventKind::MemberJoin));
        let rules = RuleSet::new(vec![
            make_rule("first", "https://example.com/a"),
            only_joins,
            make_rule("last", "https://example.com/c"),
        ]);

        let event = make_event("message", Some("1"), Some("2"));
        let matched: Vec<&str> = rules
            .matching(&event)
            .into_iter()
            .map(|rule| rule.name.as_str())
            .collect();

        assert_eq!(matched, vec!["first", "last"]);
    }

    #[test]
    fn matching_excludes_disabled_rules() {
        let mut off = make_rule("off", "https://example.com/a");
        off.enabled = false;
        let rules = RuleSet::new(vec![off, make_rule("on", "https://example.com/b")]);

        let event = make_event("message", None, None);
        let matched = rules.matching(&event);

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "on");
    }

    #[test]
    fn matching_is_idempotent() {
        let rules = RuleSet::new(vec![
            make_rule("a", "https://example.com/a"),
            make_rule("b", "https://example.com/b"),
        ]);
        let event = make_event("message", Some("1"), Some("2"));

        let first: Vec<String> = rules
            .matching(&event)
            .into_iter()
            .map(|rule| rule.name.clone())
            .collect();
        let second: Vec<String> = rules
            .matching(&event)
            .into_iter()
            .map(|rule| rule.name.clone())
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn unscoped_rule_matches_events_without_ids() {
        let rule = make_rule("all", "https://example.com/a");

        assert!(rule.matches(&make_event("message", None, None)));
    }

    #[test]
    fn rule_deserializes_from_minimal_toml() {
        let rule: Rule = toml::from_str(
            r#"
            name = "minimal"
            webhook_url = "https://example.com/hook"
            "#,
        )
        .unwrap();

        assert!(rule.enabled);
        assert!(rule.event_type.is_none());
        assert!(rule.scope_type.is_none());
    }

    #[test]
    fn event_type_list_deserializes() {
        let rule: Rule = toml::from_str(
            r#"
            name = "list"
            webhook_url = "https://example.com/hook"
            event_type = ["message", "member_join"]
            "#,
        )
        .unwrap();

        assert_eq!(
            rule.event_type,
            Some(EventTypeFilter::Many(vec![
                EventKind::Message,
                EventKind::MemberJoin,
            ]))
        );
    }
}
