//! `CrashDetector` (`spec.md` §4.5) — classifies a `PaneSnapshot` against
//! prior agent state into a `HealthVerdict`. Pure: the only mutation it
//! performs is returned in the verdict for `StateTracker` to apply.

use regex::Regex;

use crate::config::{CrashConfig, SignaturePattern};
use crate::error::CoreError;
use crate::model::{HealthVerdict, PaneSnapshot, Timestamp, VerdictKind};

enum CompiledErrorSignature {
    Literal { id: String, needle: String },
    Regex { id: String, re: Regex },
}

impl CompiledErrorSignature {
    fn id(&self) -> &str {
        match self {
            CompiledErrorSignature::Literal { id, .. } => id,
            CompiledErrorSignature::Regex { id, .. } => id,
        }
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            CompiledErrorSignature::Literal { needle, .. } => text.contains(needle.as_str()),
            CompiledErrorSignature::Regex { re, .. } => re.is_match(text),
        }
    }
}

/// The prior state the classifier needs to see, supplied by `StateTracker`.
/// Deliberately a plain struct rather than the tracker's own `Agent` type so
/// the detector stays decoupled from tracker internals (spec.md §9,
/// "cyclic references" note).
#[derive(Debug, Clone)]
pub struct PriorContext {
    pub previous_snapshot_hash: Option<u64>,
    pub previous_verdict_kind: Option<VerdictKind>,
    pub consecutive_idle_samples: u16,
    pub in_grace_window: bool,
}

pub struct CrashDetector {
    error_signatures: Vec<CompiledErrorSignature>,
    stuck_threshold: u16,
}

impl CrashDetector {
    pub fn compile(config: &CrashConfig) -> Result<Self, CoreError> {
        let mut error_signatures = Vec::with_capacity(config.terminal_error_signatures.len());
        for sig in &config.terminal_error_signatures {
            error_signatures.push(Self::compile_one(sig)?);
        }
        Ok(Self {
            error_signatures,
            stuck_threshold: config.stuck_threshold,
        })
    }

    fn compile_one(sig: &SignaturePattern) -> Result<CompiledErrorSignature, CoreError> {
        if sig.is_regex {
            let re = Regex::new(&sig.pattern)
                .map_err(|e| CoreError::ClassifierMisconfig(e.to_string()))?;
            Ok(CompiledErrorSignature::Regex {
                id: sig.id.clone(),
                re,
            })
        } else {
            Ok(CompiledErrorSignature::Literal {
                id: sig.id.clone(),
                needle: sig.pattern.clone(),
            })
        }
    }

    fn matched_error_signature(&self, text: &str) -> Option<&str> {
        self.error_signatures
            .iter()
            .find(|s| s.matches(text))
            .map(|s| s.id())
    }

    /// Decision rules, evaluated in order; the first matching rule wins
    /// (`spec.md` §4.5).
    pub fn classify(&self, snapshot: &PaneSnapshot, prior: &PriorContext) -> HealthVerdict {
        let captured_at: Timestamp = snapshot.captured_at;

        // Rule 1: grace window suppresses everything except terminal errors.
        if prior.in_grace_window {
            if let Some(id) = self.matched_error_signature(&snapshot.text) {
                return HealthVerdict {
                    kind: VerdictKind::Crashed,
                    reason: id.to_string(),
                    snapshot_hash: snapshot.content_hash,
                    captured_at,
                };
            }
            return HealthVerdict {
                kind: VerdictKind::Starting,
                reason: "within grace window".to_string(),
                snapshot_hash: snapshot.content_hash,
                captured_at,
            };
        }

        // Rule 2: terminal-error signature present, anywhere, anytime.
        if let Some(id) = self.matched_error_signature(&snapshot.text) {
            return HealthVerdict {
                kind: VerdictKind::Crashed,
                reason: id.to_string(),
                snapshot_hash: snapshot.content_hash,
                captured_at,
            };
        }

        let unchanged = prior.previous_snapshot_hash == Some(snapshot.content_hash);

        // Rule 3: unchanged + previously idle + about to cross stuck_threshold.
        if unchanged
            && prior.previous_verdict_kind == Some(VerdictKind::Idle)
            && prior.consecutive_idle_samples + 1 >= self.stuck_threshold
        {
            return HealthVerdict {
                kind: VerdictKind::Stuck,
                reason: format!("idle for {} consecutive samples", prior.consecutive_idle_samples + 1),
                snapshot_hash: snapshot.content_hash,
                captured_at,
            };
        }

        // Rule 4: unchanged -> idle.
        if unchanged {
            return HealthVerdict {
                kind: VerdictKind::Idle,
                reason: "pane content unchanged".to_string(),
                snapshot_hash: snapshot.content_hash,
                captured_at,
            };
        }

        // Rule 5: changed -> active.
        HealthVerdict {
            kind: VerdictKind::Active,
            reason: "pane content changed".to_string(),
            snapshot_hash: snapshot.content_hash,
            captured_at,
        }
    }
}
