//! `StateTracker` (`spec.md` §4.6) — the authoritative per-agent state and
//! per-session PM recovery records, plus the diagnostics ring buffer and the
//! on-disk snapshot lifecycle.
//!
//! Sharded by target hash so verdict application for one target is
//! serialized without serializing unrelated targets (`spec.md` §5's
//! per-target-mutex requirement), the way a sharded cache would be built in
//! this codebase's sibling daemon crates.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::model::{now_unix, Agent, AgentRole, AgentState, HealthVerdict, Timestamp, VerdictKind};
use crate::recovery::{PmRecoveryRecord, RecoveryOutcome};
use crate::target::Target;

const SHARD_COUNT: usize = 16;
const RING_BUFFER_CAPACITY: usize = 1024;

/// One applied transition, emitted for `PmRecovery` and `NotificationQueue`
/// to consume without either calling back into the tracker (`spec.md` §9).
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub target: Target,
    pub role: AgentRole,
    pub from: AgentState,
    pub to: AgentState,
    pub verdict_kind: VerdictKind,
    pub reason: String,
    pub at: Timestamp,
}

fn shard_of(target: &Target) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    target.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

struct Shard {
    agents: HashMap<Target, Agent>,
}

/// Transition table of `spec.md` §4.6. `None` means "no transition" (used
/// for `Unknown` verdicts and the PM-only `Crashed -> Recovering` edge when
/// the role isn't PM).
fn next_state(current: AgentState, verdict: VerdictKind, role: AgentRole) -> Option<AgentState> {
    use AgentState as S;
    use VerdictKind as V;
    match (current, verdict) {
        (_, V::Unknown) => None,
        (S::Gone, _) => None,

        (S::Starting, V::Active) => Some(S::Active),
        (S::Starting, V::Idle) | (S::Starting, V::Starting) => Some(S::Starting),
        (S::Starting, V::Stuck) => Some(S::Starting),
        (S::Starting, V::Crashed) => Some(S::Crashed),

        (S::Active, V::Active) => Some(S::Active),
        (S::Active, V::Idle) => Some(S::Idle),
        (S::Active, V::Stuck) => Some(S::Stuck),
        (S::Active, V::Crashed) => Some(S::Crashed),
        (S::Active, V::Starting) => Some(S::Active),

        (S::Idle, V::Active) => Some(S::Active),
        (S::Idle, V::Idle) | (S::Idle, V::Starting) => Some(S::Idle),
        (S::Idle, V::Stuck) => Some(S::Stuck),
        (S::Idle, V::Crashed) => Some(S::Crashed),

        (S::Stuck, V::Active) => Some(S::Active),
        (S::Stuck, V::Idle) | (S::Stuck, V::Starting) => Some(S::Stuck),
        (S::Stuck, V::Stuck) => Some(S::Stuck),
        (S::Stuck, V::Crashed) => Some(S::Crashed),

        (S::Crashed, V::Active) if role.is_pm() => Some(S::Recovering),
        (S::Crashed, V::Active) => Some(S::Crashed),
        (S::Crashed, _) => Some(S::Crashed),

        (S::Recovering, V::Active) => None, // requires confirm_samples; handled by caller
        (S::Recovering, V::Crashed) => Some(S::Crashed),
        (S::Recovering, _) => Some(S::Recovering),
    }
}

/// `StateTracker` exclusively owns `Agent` and `PmRecoveryRecord` records
/// (`spec.md` §3).
pub struct StateTracker {
    shards: Vec<Mutex<Shard>>,
    pm_records: Mutex<HashMap<String, PmRecoveryRecord>>,
    ring: Mutex<VecDeque<TransitionRecord>>,
    missing_threshold: u16,
    confirm_samples: u8,
    recovering_active_streak: Mutex<HashMap<Target, u8>>,
    // Guards status() snapshots against torn reads across shards.
    snapshot_lock: RwLock<()>,
}

impl StateTracker {
    pub fn new(missing_threshold: u16, confirm_samples: u8) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| {
                    Mutex::new(Shard {
                        agents: HashMap::new(),
                    })
                })
                .collect(),
            pm_records: Mutex::new(HashMap::new()),
            ring: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)),
            missing_threshold,
            confirm_samples,
            recovering_active_streak: Mutex::new(HashMap::new()),
            snapshot_lock: RwLock::new(()),
        }
    }

    fn push_ring(&self, record: TransitionRecord) {
        let mut ring = self.ring.lock();
        if ring.len() == RING_BUFFER_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    pub fn get(&self, target: &Target) -> Option<Agent> {
        let shard = self.shards[shard_of(target)].lock();
        shard.agents.get(target).cloned()
    }

    /// Insert a freshly discovered target as `STARTING` if it's not already
    /// known (`spec.md` §4.4).
    pub fn observe_discovered(&self, target: &Target, role: AgentRole) {
        let _guard = self.snapshot_lock.read();
        let mut shard = self.shards[shard_of(target)].lock();
        shard
            .agents
            .entry(target.clone())
            .or_insert_with(|| Agent::new_starting(target.clone(), role, now_unix()));
        if let Some(agent) = shard.agents.get_mut(target) {
            agent.consecutive_missing_samples = 0;
        }
    }

    /// A target absent from this cycle's discovery list: increment its
    /// missing counter and transition to `GONE` past the threshold
    /// (`spec.md` §4.4, §4.6).
    pub fn observe_missing(&self, target: &Target) -> Option<TransitionRecord> {
        let _guard = self.snapshot_lock.read();
        let mut shard = self.shards[shard_of(target)].lock();
        let agent = shard.agents.get_mut(target)?;
        agent.consecutive_missing_samples += 1;
        let from = agent.state;
        if agent.consecutive_missing_samples >= self.missing_threshold && from != AgentState::Gone {
            agent.state = AgentState::Gone;
            let record = TransitionRecord {
                target: target.clone(),
                role: agent.role,
                from,
                to: AgentState::Gone,
                verdict_kind: VerdictKind::Unknown,
                reason: "missing-sample threshold exceeded".to_string(),
                at: now_unix(),
            };
            self.push_ring(record.clone());
            return Some(record);
        }
        None
    }

    /// Immediate `GONE` transition for a permanent adapter error, bypassing
    /// the missing-sample threshold (`spec.md` §4.8).
    pub fn force_gone(&self, target: &Target) -> Option<TransitionRecord> {
        let _guard = self.snapshot_lock.read();
        let mut shard = self.shards[shard_of(target)].lock();
        let agent = shard.agents.get_mut(target)?;
        let from = agent.state;
        if from == AgentState::Gone {
            return None;
        }
        agent.state = AgentState::Gone;
        let record = TransitionRecord {
            target: target.clone(),
            role: agent.role,
            from,
            to: AgentState::Gone,
            verdict_kind: VerdictKind::Unknown,
            reason: "permanent adapter error".to_string(),
            at: now_unix(),
        };
        self.push_ring(record.clone());
        Some(record)
    }

    /// Apply a `HealthVerdict` to the tracked agent, returning the
    /// transition if one occurred (`spec.md` §4.6).
    pub fn apply(&self, target: &Target, verdict: &HealthVerdict) -> Option<TransitionRecord> {
        let _guard = self.snapshot_lock.read();

        if verdict.kind == VerdictKind::Unknown {
            // "no transition" per spec.md §4.8; missing counter untouched.
            return None;
        }

        let mut shard = self.shards[shard_of(target)].lock();
        let agent = shard.agents.get_mut(target)?;
        let from = agent.state;

        if verdict.kind == VerdictKind::Idle {
            agent.consecutive_idle_samples += 1;
        } else if verdict.kind == VerdictKind::Active {
            agent.consecutive_idle_samples = 0;
            agent.last_seen_active_at = verdict.captured_at;
        }

        let to = if from == AgentState::Recovering && verdict.kind == VerdictKind::Active {
            let mut streaks = self.recovering_active_streak.lock();
            let streak = streaks.entry(target.clone()).or_insert(0);
            *streak += 1;
            if *streak >= self.confirm_samples {
                streaks.remove(target);
                AgentState::Active
            } else {
                AgentState::Recovering
            }
        } else {
            if from == AgentState::Recovering && verdict.kind != VerdictKind::Unknown {
                self.recovering_active_streak.lock().remove(target);
            }
            next_state(from, verdict.kind, agent.role).unwrap_or(from)
        };

        if to == from {
            return None;
        }

        agent.state = to;
        let record = TransitionRecord {
            target: target.clone(),
            role: agent.role,
            from,
            to,
            verdict_kind: verdict.kind,
            reason: verdict.reason.clone(),
            at: verdict.captured_at,
        };
        drop(shard);
        self.push_ring(record.clone());
        info!(target = %record.target, from = ?record.from, to = ?record.to, "agent state transition");
        Some(record)
    }

    pub fn recent_transitions(&self, limit: usize) -> Vec<TransitionRecord> {
        let ring = self.ring.lock();
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn counts_by_state(&self) -> HashMap<AgentState, usize> {
        let _guard = self.snapshot_lock.write();
        let mut counts = HashMap::new();
        for shard in &self.shards {
            for agent in shard.lock().agents.values() {
                *counts.entry(agent.state).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn all_agents(&self) -> Vec<Agent> {
        let _guard = self.snapshot_lock.write();
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.lock().agents.values().cloned());
        }
        out
    }

    pub fn pm_record(&self, session: &str) -> Option<PmRecoveryRecord> {
        self.pm_records.lock().get(session).cloned()
    }

    pub fn set_pm_record(&self, session: &str, record: PmRecoveryRecord) {
        self.pm_records.lock().insert(session.to_string(), record);
    }

    pub fn all_pm_records(&self) -> HashMap<String, PmRecoveryRecord> {
        self.pm_records.lock().clone()
    }

    pub fn reset_pm_record(&self, session: &str) {
        self.pm_records.lock().insert(
            session.to_string(),
            PmRecoveryRecord {
                attempt_count: 0,
                last_attempt_at: 0,
                grace_until: 0,
                cooldown_until: 0,
                last_outcome: RecoveryOutcome::None,
            },
        );
    }

    /// Discard tracked entries whose target no longer exists, called after
    /// restoring a persisted snapshot (`spec.md` §6).
    pub fn prune_targets_not_in(&self, live: &std::collections::HashSet<Target>) {
        for shard in &self.shards {
            shard.lock().agents.retain(|t, _| live.contains(t));
        }
    }

    pub fn load_agent(&self, agent: Agent) {
        let shard_idx = shard_of(&agent.target);
        self.shards[shard_idx].lock().agents.insert(agent.target.clone(), agent);
    }

    pub fn warn_if_duplicate(&self, count: usize) {
        if count > 0 {
            warn!(count, "discovery pass produced duplicate targets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(kind: VerdictKind) -> HealthVerdict {
        HealthVerdict {
            kind,
            reason: "test".to_string(),
            snapshot_hash: 0,
            captured_at: 1,
        }
    }

    #[test]
    fn starting_to_active_on_active_verdict() {
        let tracker = StateTracker::new(3, 2);
        let target: Target = "a:0".parse().unwrap();
        tracker.observe_discovered(&target, AgentRole::Developer);
        let t = tracker.apply(&target, &verdict(VerdictKind::Active)).unwrap();
        assert_eq!(t.from, AgentState::Starting);
        assert_eq!(t.to, AgentState::Active);
    }

    #[test]
    fn unknown_verdict_never_transitions() {
        let tracker = StateTracker::new(3, 2);
        let target: Target = "a:0".parse().unwrap();
        tracker.observe_discovered(&target, AgentRole::Developer);
        assert!(tracker.apply(&target, &verdict(VerdictKind::Unknown)).is_none());
        assert_eq!(tracker.get(&target).unwrap().state, AgentState::Starting);
    }

    #[test]
    fn missing_past_threshold_transitions_to_gone() {
        let tracker = StateTracker::new(3, 2);
        let target: Target = "a:0".parse().unwrap();
        tracker.observe_discovered(&target, AgentRole::Developer);
        assert!(tracker.observe_missing(&target).is_none());
        assert!(tracker.observe_missing(&target).is_none());
        let t = tracker.observe_missing(&target).unwrap();
        assert_eq!(t.to, AgentState::Gone);
    }

    #[test]
    fn crashed_pm_requires_two_active_verdicts_to_confirm() {
        let tracker = StateTracker::new(3, 2);
        let target: Target = "pm:0".parse().unwrap();
        tracker.observe_discovered(&target, AgentRole::ProjectManager);
        tracker.apply(&target, &verdict(VerdictKind::Crashed));
        assert_eq!(tracker.get(&target).unwrap().state, AgentState::Crashed);

        let t1 = tracker.apply(&target, &verdict(VerdictKind::Active));
        assert_eq!(t1.unwrap().to, AgentState::Recovering);

        // First active sample inside Recovering: still recovering.
        let t2 = tracker.apply(&target, &verdict(VerdictKind::Active));
        assert!(t2.is_none());
        assert_eq!(tracker.get(&target).unwrap().state, AgentState::Recovering);

        let t3 = tracker.apply(&target, &verdict(VerdictKind::Active));
        assert_eq!(t3.unwrap().to, AgentState::Active);
    }

    #[test]
    fn crashed_non_pm_active_verdict_stays_crashed() {
        let tracker = StateTracker::new(3, 2);
        let target: Target = "dev:0".parse().unwrap();
        tracker.observe_discovered(&target, AgentRole::Developer);
        tracker.apply(&target, &verdict(VerdictKind::Crashed));
        let t = tracker.apply(&target, &verdict(VerdictKind::Active));
        assert!(t.is_none());
        assert_eq!(tracker.get(&target).unwrap().state, AgentState::Crashed);
    }

    #[test]
    fn recovering_crash_resets_confirmation_streak() {
        let tracker = StateTracker::new(3, 2);
        let target: Target = "pm:0".parse().unwrap();
        tracker.observe_discovered(&target, AgentRole::ProjectManager);
        tracker.apply(&target, &verdict(VerdictKind::Crashed));
        tracker.apply(&target, &verdict(VerdictKind::Active)); // -> Recovering
        tracker.apply(&target, &verdict(VerdictKind::Crashed)); // crash again mid-recovery
        assert_eq!(tracker.get(&target).unwrap().state, AgentState::Crashed);
        // confirmation streak must have been cleared: two more actives needed
        let t1 = tracker.apply(&target, &verdict(VerdictKind::Active));
        assert_eq!(t1.unwrap().to, AgentState::Recovering);
        assert!(tracker.apply(&target, &verdict(VerdictKind::Active)).is_none());
        assert_eq!(
            tracker.apply(&target, &verdict(VerdictKind::Active)).unwrap().to,
            AgentState::Active
        );
    }

    #[test]
    fn ring_buffer_caps_at_capacity() {
        let tracker = StateTracker::new(1000, 2);
        let target: Target = "a:0".parse().unwrap();
        tracker.observe_discovered(&target, AgentRole::Developer);
        for i in 0..(RING_BUFFER_CAPACITY + 10) {
            let kind = if i % 2 == 0 { VerdictKind::Active } else { VerdictKind::Idle };
            tracker.apply(&target, &verdict(kind));
        }
        assert!(tracker.recent_transitions(usize::MAX).len() <= RING_BUFFER_CAPACITY);
    }
}
