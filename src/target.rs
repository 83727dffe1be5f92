//! [`Target`] — the canonical `session:window` address of a multiplexer window.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Canonical address of a tmux window: `session:window`.
///
/// `session` is non-empty over `[A-Za-z0-9_-]`; `window` is a non-negative
/// integer. Equality is string equality of the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Target {
    session: String,
    window: u32,
}

impl Target {
    pub fn new(session: impl Into<String>, window: u32) -> Result<Self, CoreError> {
        let session = session.into();
        if session.is_empty() || !session.chars().all(is_session_char) {
            return Err(CoreError::InvalidTarget(format!("{session}:{window}")));
        }
        Ok(Self { session, window })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Sort key for the `(session, window_index)` ordering guarantee of
    /// `AgentDiscovery` (`spec.md` §4.4).
    pub fn sort_key(&self) -> (&str, u32) {
        (&self.session, self.window)
    }
}

fn is_session_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.window)
    }
}

impl FromStr for Target {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session, window) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::InvalidTarget(s.to_string()))?;
        let window: u32 = window
            .parse()
            .map_err(|_| CoreError::InvalidTarget(s.to_string()))?;
        Target::new(session, window)
    }
}

impl TryFrom<String> for Target {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_form() {
        let t: Target = "backend:0".parse().unwrap();
        assert_eq!(t.session(), "backend");
        assert_eq!(t.window(), 0);
        assert_eq!(t.to_string(), "backend:0");
    }

    #[test]
    fn rejects_missing_colon() {
        assert!("backend".parse::<Target>().is_err());
    }

    #[test]
    fn rejects_non_numeric_window() {
        assert!("backend:abc".parse::<Target>().is_err());
    }

    #[test]
    fn rejects_empty_session() {
        assert!(":0".parse::<Target>().is_err());
    }

    #[test]
    fn rejects_invalid_session_chars() {
        assert!("back end:0".parse::<Target>().is_err());
    }

    #[test]
    fn equality_is_canonical_string_equality() {
        let a: Target = "qa:2".parse().unwrap();
        let b = Target::new("qa", 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sort_key_orders_by_session_then_window() {
        let mut targets: Vec<Target> = vec!["b:1", "a:2", "a:0"]
            .into_iter()
            .map(|s| s.parse().unwrap())
            .collect();
        targets.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let rendered: Vec<String> = targets.iter().map(Target::to_string).collect();
        assert_eq!(rendered, vec!["a:0", "a:2", "b:1"]);
    }
}
