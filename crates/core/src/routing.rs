//! Hierarchical routing keys.
//!
//! A key is the triple `channel/messageType/actionType`. Handlers register
//! partial keys (trailing components absent) and incoming messages carry
//! full keys; [`RoutingKey::matches`] decides whether a pattern accepts a
//! message.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SwitchyardError;

/// Number of `/`-separated segments in a canonical key.
pub const SEGMENT_COUNT: usize = 3;

/// Segment separator used in canonical and prefix keys.
pub const SEPARATOR: char = '/';

/// Immutable `channel/messageType/actionType` routing key.
///
/// Components are trimmed; empty or whitespace-only components are treated
/// as absent. Equality and hashing use the lowercase canonical form, so two
/// keys that differ only in case are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey {
    channel: Option<String>,
    message_type: Option<String>,
    action_type: Option<String>,
    canonical: String,
}

fn normalize(component: Option<&str>) -> Option<String> {
    component
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Case-insensitive comparison without allocating.
fn segment_eq(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

impl RoutingKey {
    /// Build a key from string components. Empty strings mean "absent".
    pub fn new(channel: &str, message_type: &str, action_type: &str) -> Self {
        Self::from_parts(Some(channel), Some(message_type), Some(action_type))
    }

    /// Build a key from optional components.
    pub fn from_parts(
        channel: Option<&str>,
        message_type: Option<&str>,
        action_type: Option<&str>,
    ) -> Self {
        let channel = normalize(channel);
        let message_type = normalize(message_type);
        let action_type = normalize(action_type);

        let canonical = [&channel, &message_type, &action_type]
            .iter()
            .map(|c| c.as_deref().unwrap_or("").to_lowercase())
            .collect::<Vec<_>>()
            .join("/");

        Self {
            channel,
            message_type,
            action_type,
            canonical,
        }
    }

    /// Parse a canonical `channel/messageType/actionType` string.
    ///
    /// Exactly [`SEGMENT_COUNT`] segments are required; empty segments are
    /// absent components.
    pub fn parse(key: &str) -> Result<Self, SwitchyardError> {
        let segments: Vec<&str> = key.split(SEPARATOR).collect();
        if segments.len() != SEGMENT_COUNT {
            return Err(SwitchyardError::RoutingFormat {
                key: key.to_string(),
                expected: SEGMENT_COUNT,
                segments: segments.len(),
            });
        }
        Ok(Self::from_parts(
            Some(segments[0]),
            Some(segments[1]),
            Some(segments[2]),
        ))
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn action_type(&self) -> Option<&str> {
        self.action_type.as_deref()
    }

    /// Lowercase `channel/messageType/actionType`, absent components empty.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// True when any component is absent.
    pub fn is_partial(&self) -> bool {
        self.components().any(|c| c.is_none())
    }

    /// Number of leading components that are present.
    ///
    /// Components after the first absent one never take part in matching,
    /// so they do not count towards specificity either.
    pub fn specificity(&self) -> usize {
        self.components().take_while(|c| c.is_some()).count()
    }

    fn components(&self) -> impl Iterator<Item = Option<&str>> {
        [
            self.channel.as_deref(),
            self.message_type.as_deref(),
            self.action_type.as_deref(),
        ]
        .into_iter()
    }

    /// Directional match of this key (the pattern) against `candidate`.
    ///
    /// A full key matches only an equal key. A partial key walks
    /// channel, message type, action type in order: the first absent
    /// component matches anything that follows, a present component must
    /// equal the candidate's (case-insensitively).
    pub fn matches(&self, candidate: &RoutingKey) -> bool {
        if !self.is_partial() {
            return self.canonical == candidate.canonical;
        }

        for (mine, theirs) in self.components().zip(candidate.components()) {
            let Some(mine) = mine else {
                return true;
            };
            match theirs {
                Some(theirs) if segment_eq(mine, theirs) => continue,
                _ => return false,
            }
        }
        true
    }

    /// `/`-joined lowercase prefix up to the first absent component.
    ///
    /// `orders/create/` yields `orders/create`; a key with no channel yields
    /// an empty string.
    pub fn to_prefix_key(&self) -> String {
        self.components()
            .map_while(|c| c.map(str::to_lowercase))
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl PartialEq for RoutingKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for RoutingKey {}

impl Hash for RoutingKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for RoutingKey {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = SwitchyardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.canonical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_are_trimmed_and_blank_is_absent() {
        let key = RoutingKey::from_parts(Some("  Orders "), Some("   "), None);
        assert_eq!(key.channel(), Some("Orders"));
        assert_eq!(key.message_type(), None);
        assert_eq!(key.action_type(), None);
        assert!(key.is_partial());
        assert_eq!(key.canonical(), "orders//");
    }

    #[test]
    fn canonical_is_lowercase_and_equality_ignores_case() {
        let a = RoutingKey::new("Orders", "Create", "Update");
        let b = RoutingKey::new("orders", "CREATE", "update");
        assert_eq!(a.canonical(), "orders/create/update");
        assert_eq!(a, b);
        assert!(!a.is_partial());
    }

    #[test]
    fn full_key_match_is_reflexive_and_case_insensitive() {
        let a = RoutingKey::new("orders", "create", "update");
        assert!(a.matches(&a));
        assert!(a.matches(&RoutingKey::new("ORDERS", "Create", "UPDATE")));
        assert!(!a.matches(&RoutingKey::new("orders", "create", "delete")));
    }

    #[test]
    fn partial_match_is_directional() {
        let pattern = RoutingKey::new("orders", "create", "");
        let full = RoutingKey::new("orders", "create", "update");
        assert!(pattern.matches(&full));
        assert!(!full.matches(&pattern));
    }

    #[test]
    fn partial_match_stops_at_first_absent_component() {
        let channel_only = RoutingKey::from_parts(Some("orders"), None, Some("ignored"));
        assert!(channel_only.matches(&RoutingKey::new("Orders", "create", "update")));
        assert!(channel_only.matches(&RoutingKey::new("orders", "refund", "")));
        assert!(!channel_only.matches(&RoutingKey::new("billing", "create", "update")));

        let wildcard = RoutingKey::new("", "", "");
        assert!(wildcard.matches(&RoutingKey::new("anything", "at", "all")));
    }

    #[test]
    fn partial_pattern_rejects_candidate_missing_a_required_component() {
        let pattern = RoutingKey::new("orders", "create", "");
        assert!(!pattern.matches(&RoutingKey::new("orders", "", "")));
    }

    #[test]
    fn parse_requires_exactly_three_segments() {
        let key = RoutingKey::parse("orders/create/").unwrap();
        assert_eq!(key.channel(), Some("orders"));
        assert_eq!(key.message_type(), Some("create"));
        assert!(key.is_partial());

        for bad in ["", "orders", "orders/create", "a/b/c/d"] {
            let err = RoutingKey::parse(bad).unwrap_err();
            assert!(
                matches!(err, SwitchyardError::RoutingFormat { expected: 3, .. }),
                "expected format error for {bad:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn parse_of_canonical_string_round_trips() {
        let key = RoutingKey::new("Orders", "Create", "Update");
        let parsed: RoutingKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert!(parsed.matches(&key));
    }

    #[test]
    fn prefix_key_stops_at_first_absent_component() {
        assert_eq!(
            RoutingKey::new("Orders", "Create", "").to_prefix_key(),
            "orders/create"
        );
        assert_eq!(
            RoutingKey::from_parts(Some("orders"), None, Some("x")).to_prefix_key(),
            "orders"
        );
        assert_eq!(RoutingKey::new("", "a", "b").to_prefix_key(), "");
        assert_eq!(
            RoutingKey::new("a", "b", "c").to_prefix_key(),
            "a/b/c"
        );
    }

    #[test]
    fn specificity_counts_leading_components() {
        assert_eq!(RoutingKey::new("a", "b", "c").specificity(), 3);
        assert_eq!(RoutingKey::new("a", "b", "").specificity(), 2);
        assert_eq!(RoutingKey::from_parts(Some("a"), None, Some("c")).specificity(), 1);
        assert_eq!(RoutingKey::new("", "", "").specificity(), 0);
    }

    #[test]
    fn serde_uses_canonical_string() {
        let key = RoutingKey::new("orders", "create", "");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"orders/create/\"");
        let back: RoutingKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<RoutingKey>("\"orders\"").is_err());
    }
}
