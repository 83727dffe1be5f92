//! Core data model shared across discovery, detection, and tracking:
//! `AgentRole`, `Agent`, `AgentState`, `PaneSnapshot`, `HealthVerdict`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::target::Target;

/// Closed enumeration of agent roles, assigned by `AgentDiscovery` from pane
/// content. Only `PROJECT_MANAGER` carries recovery semantics (`spec.md` §9,
/// Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    ProjectManager,
    Developer,
    Qa,
    Devops,
    Reviewer,
    Researcher,
    Writer,
    Other,
}

impl AgentRole {
    pub fn as_u8(self) -> u8 {
        match self {
            AgentRole::ProjectManager => 0,
            AgentRole::Developer => 1,
            AgentRole::Qa => 2,
            AgentRole::Devops => 3,
            AgentRole::Reviewer => 4,
            AgentRole::Researcher => 5,
            AgentRole::Writer => 6,
            AgentRole::Other => 7,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => AgentRole::ProjectManager,
            1 => AgentRole::Developer,
            2 => AgentRole::Qa,
            3 => AgentRole::Devops,
            4 => AgentRole::Reviewer,
            5 => AgentRole::Researcher,
            6 => AgentRole::Writer,
            _ => AgentRole::Other,
        }
    }

    pub fn is_pm(self) -> bool {
        matches!(self, AgentRole::ProjectManager)
    }
}

/// `AgentState` transition table lives in `tracker.rs`; this is just the
/// closed enumeration from `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    Starting,
    Active,
    Idle,
    Stuck,
    Crashed,
    Recovering,
    Gone,
}

impl AgentState {
    pub fn as_u8(self) -> u8 {
        match self {
            AgentState::Starting => 0,
            AgentState::Active => 1,
            AgentState::Idle => 2,
            AgentState::Stuck => 3,
            AgentState::Crashed => 4,
            AgentState::Recovering => 5,
            AgentState::Gone => 6,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => AgentState::Starting,
            1 => AgentState::Active,
            2 => AgentState::Idle,
            3 => AgentState::Stuck,
            4 => AgentState::Crashed,
            5 => AgentState::Recovering,
            _ => AgentState::Gone,
        }
    }
}

/// Unix-seconds timestamp, used throughout the data model and the on-disk
/// snapshot format (`spec.md` §6) instead of a richer calendar type, since
/// the wire format is a flat integer anyway.
pub type Timestamp = u64;

pub fn now_unix() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// An agent tracked by `StateTracker`, identified by its `Target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub target: Target,
    pub role: AgentRole,
    pub state: AgentState,
    pub discovered_at: Timestamp,
    pub last_seen_active_at: Timestamp,
    pub consecutive_idle_samples: u16,
    pub consecutive_missing_samples: u16,
    pub briefing_digest: Option<[u8; 16]>,
}

impl Agent {
    pub fn new_starting(target: Target, role: AgentRole, now: Timestamp) -> Self {
        Self {
            target,
            role,
            state: AgentState::Starting,
            discovered_at: now,
            last_seen_active_at: now,
            consecutive_idle_samples: 0,
            consecutive_missing_samples: 0,
            briefing_digest: None,
        }
    }
}

/// Opaque captured pane text plus capture time and content hash. Never
/// persisted to disk, only cached (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct PaneSnapshot {
    pub target: Target,
    pub text: String,
    pub captured_at: Timestamp,
    pub content_hash: u64,
}

impl PaneSnapshot {
    pub fn new(target: Target, text: String, captured_at: Timestamp) -> Self {
        let content_hash = hash_content(&text);
        Self {
            target,
            text,
            captured_at,
            content_hash,
        }
    }
}

/// FNV-1a over the snapshot bytes: fast, stable, dependency-free, and all we
/// need since the hash is only ever compared for equality against the prior
/// snapshot, never persisted or transmitted.
fn hash_content(text: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    text.bytes().fold(OFFSET, |h, b| (h ^ b as u64).wrapping_mul(PRIME))
}

/// The verdict kind a `CrashDetector` rule matches. Distinct from
/// `AgentState` because `Unknown` is not a tracker state -- it means "no
/// transition" (`spec.md` §4.8 failure semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    Starting,
    Active,
    Idle,
    Stuck,
    Crashed,
    Unknown,
}

/// Output of `CrashDetector::classify`: pure function of its inputs
/// (`spec.md` §4.5).
#[derive(Debug, Clone)]
pub struct HealthVerdict {
    pub kind: VerdictKind,
    pub reason: String,
    pub snapshot_hash: u64,
    pub captured_at: Timestamp,
}

impl HealthVerdict {
    pub fn unknown(reason: impl Into<String>, captured_at: Timestamp) -> Self {
        Self {
            kind: VerdictKind::Unknown,
            reason: reason.into(),
            snapshot_hash: 0,
            captured_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(hash_content("hello"), hash_content("hello"));
        assert_ne!(hash_content("hello"), hash_content("world"));
    }

    #[test]
    fn role_round_trips_through_u8() {
        for role in [
            AgentRole::ProjectManager,
            AgentRole::Developer,
            AgentRole::Qa,
            AgentRole::Devops,
            AgentRole::Reviewer,
            AgentRole::Researcher,
            AgentRole::Writer,
            AgentRole::Other,
        ] {
            assert_eq!(AgentRole::from_u8(role.as_u8()), role);
        }
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            AgentState::Starting,
            AgentState::Active,
            AgentState::Idle,
            AgentState::Stuck,
            AgentState::Crashed,
            AgentState::Recovering,
            AgentState::Gone,
        ] {
            assert_eq!(AgentState::from_u8(state.as_u8()), state);
        }
    }
}
