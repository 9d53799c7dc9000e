//! Event type patterns
//!
//! Event types are dotted tags (`agent.tool_use`, `spec.phase_completed`).
//! Patterns select them by exact match, by leading segment (`agent.*`), by
//! trailing segment (`*.completed`), or match everything (`*`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A single event type pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventPattern {
    /// `*`
    Any,
    /// `agent.error`
    Exact(String),
    /// `agent.*` (stored without the wildcard, with the trailing dot)
    Prefix(String),
    /// `*.completed` (stored without the wildcard, with the leading dot)
    Suffix(String),
}

impl EventPattern {
    /// Parse a pattern string
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::InvalidPattern(raw.to_string()));
        }
        if raw == "*" {
            return Ok(Self::Any);
        }

        let leading = raw.starts_with("*.");
        let trailing = raw.ends_with(".*");
        let inner_wildcard = raw
            .trim_start_matches("*.")
            .trim_end_matches(".*")
            .contains('*');

        match (leading, trailing, inner_wildcard) {
            (false, false, false) => Ok(Self::Exact(raw.to_string())),
            (true, false, false) => Ok(Self::Suffix(raw[1..].to_string())),
            (false, true, false) => Ok(Self::Prefix(raw[..raw.len() - 1].to_string())),
            _ => Err(ConfigError::InvalidPattern(raw.to_string())),
        }
    }

    /// Check whether an event type matches
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(exact) => event_type == exact,
            Self::Prefix(prefix) => event_type.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => event_type.ends_with(suffix.as_str()),
        }
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Exact(exact) => write!(f, "{}", exact),
            Self::Prefix(prefix) => write!(f, "{}*", prefix),
            Self::Suffix(suffix) => write!(f, "*{}", suffix),
        }
    }
}

impl TryFrom<String> for EventPattern {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EventPattern> for String {
    fn from(pattern: EventPattern) -> Self {
        pattern.to_string()
    }
}

/// An ordered set of patterns; an event type matches if any pattern does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPatternSet {
    patterns: Vec<EventPattern>,
}

impl EventPatternSet {
    /// Empty set, matches nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Matches every event type
    pub fn any() -> Self {
        Self {
            patterns: vec![EventPattern::Any],
        }
    }

    /// Parse a list of pattern strings
    pub fn parse<I, S>(raw: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = raw
            .into_iter()
            .map(|p| EventPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(event_type))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[EventPattern] {
        &self.patterns
    }
}
