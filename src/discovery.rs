//! `AgentDiscovery` (`spec.md` §4.4) — enumerate windows, classify each as an
//! agent of some role by inspecting pane content.

use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use crate::cache::{LayeredCache, Namespace};
use crate::config::{CrashConfig, RoleSignature};
use crate::error::{AdapterError, CoreError};
use crate::model::AgentRole;
use crate::pool::ConnectionPool;
use crate::target::Target;

const DISCOVERY_CAPTURE_LINES: u32 = 10;

/// A compiled role-matching rule: first match wins, unmatched -> `Other`
/// (`spec.md` §4.4, §9).
enum CompiledSignature {
    Literal(String, AgentRole),
    Regex(Regex, AgentRole),
}

pub struct RoleClassifier {
    rules: Vec<CompiledSignature>,
}

impl RoleClassifier {
    pub fn compile(signatures: &[RoleSignature]) -> Result<Self, CoreError> {
        let mut rules = Vec::with_capacity(signatures.len());
        for sig in signatures {
            if sig.is_regex {
                let re = Regex::new(&sig.pattern)
                    .map_err(|e| CoreError::ClassifierMisconfig(e.to_string()))?;
                rules.push(CompiledSignature::Regex(re, sig.role));
            } else {
                rules.push(CompiledSignature::Literal(sig.pattern.clone(), sig.role));
            }
        }
        Ok(Self { rules })
    }

    pub fn classify(&self, pane_text: &str) -> AgentRole {
        for rule in &self.rules {
            let hit = match rule {
                CompiledSignature::Literal(needle, _) => pane_text.contains(needle.as_str()),
                CompiledSignature::Regex(re, _) => re.is_match(pane_text),
            };
            if hit {
                return match rule {
                    CompiledSignature::Literal(_, role) | CompiledSignature::Regex(_, role) => *role,
                };
            }
        }
        AgentRole::Other
    }
}

/// Result of one discovery pass: agents sorted by `(session, window_index)`
/// for a stable, diff-friendly order (`spec.md` §4.4).
#[derive(Debug, Clone)]
pub struct DiscoveredAgent {
    pub target: Target,
    pub role: AgentRole,
}

#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub agents: Vec<DiscoveredAgent>,
    pub duplicate_targets: Vec<Target>,
}

pub struct AgentDiscovery {
    classifier: RoleClassifier,
}

impl AgentDiscovery {
    pub fn new(crash_config: &CrashConfig) -> Result<Self, CoreError> {
        Ok(Self {
            classifier: RoleClassifier::compile(&crash_config.role_signatures)?,
        })
    }

    /// One discovery cycle: acquire the window listing via the cache
    /// (single-flight through the pool, `spec.md` §4.4 step 1), capture and
    /// classify each pane's role (also cached, so a live role isn't
    /// reclassified every cycle), sort, and flag duplicates (`spec.md` §8
    /// boundary: "duplicate discovery results").
    pub async fn discover(
        &self,
        pool: &Arc<ConnectionPool>,
        session_cache: &Arc<LayeredCache<(), Vec<Target>>>,
        role_cache: &Arc<LayeredCache<Target, AgentRole>>,
    ) -> Result<DiscoveryOutcome, AdapterError> {
        let targets = session_cache
            .get_or_compute(Namespace::SessionInfo, (), || async {
                let guard = pool.acquire().await.map_err(|_| {
                    AdapterError::Transient("pool exhausted during discovery".to_string())
                })?;
                guard.adapter().list_targets().await
            })
            .await?;

        let mut seen = std::collections::HashSet::new();
        let mut duplicate_targets = Vec::new();
        let mut agents = Vec::new();

        for target in targets {
            if !seen.insert(target.clone()) {
                duplicate_targets.push(target);
                continue;
            }

            let classifier = &self.classifier;
            let role = role_cache
                .get_or_compute(Namespace::AgentStatus, target.clone(), || async {
                    let guard = pool.acquire().await.map_err(|_| {
                        AdapterError::Transient("pool exhausted during discovery capture".to_string())
                    })?;
                    let snapshot = guard.adapter().capture(&target, DISCOVERY_CAPTURE_LINES).await?;
                    Ok(classifier.classify(&snapshot.text))
                })
                .await;

            match role {
                Ok(role) => agents.push(DiscoveredAgent { target, role }),
                Err(AdapterError::Permanent(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        agents.sort_by(|a, b| a.target.sort_key().cmp(&b.target.sort_key()));

        if !duplicate_targets.is_empty() {
            warn!(count = duplicate_targets.len(), "duplicate targets in discovery pass");
        }

        Ok(DiscoveryOutcome {
            agents,
            duplicate_targets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignaturePattern;
    use crate::tmux::mock::MockTmuxAdapter;
    use crate::tmux::TmuxAdapter as _;
    use crate::config::PoolConfig;

    fn pool_with(adapter: MockTmuxAdapter) -> Arc<ConnectionPool> {
        let adapter = Arc::new(adapter);
        ConnectionPool::new(PoolConfig::default(), move || adapter.clone())
    }

    #[test]
    fn classifier_first_match_wins() {
        let sigs = vec![
            RoleSignature {
                pattern: "pm>".into(),
                is_regex: false,
                role: AgentRole::ProjectManager,
            },
            RoleSignature {
                pattern: "dev>".into(),
                is_regex: false,
                role: AgentRole::Developer,
            },
        ];
        let classifier = RoleClassifier::compile(&sigs).unwrap();
        assert_eq!(classifier.classify("welcome pm> ready"), AgentRole::ProjectManager);
        assert_eq!(classifier.classify("dev> building"), AgentRole::Developer);
        assert_eq!(classifier.classify("nothing matches"), AgentRole::Other);
    }

    #[test]
    fn bad_regex_is_classifier_misconfig() {
        let sigs = vec![RoleSignature {
            pattern: "(unclosed".into(),
            is_regex: true,
            role: AgentRole::Qa,
        }];
        assert!(RoleClassifier::compile(&sigs).is_err());
    }

    fn caches() -> (
        Arc<LayeredCache<(), Vec<Target>>>,
        Arc<LayeredCache<Target, AgentRole>>,
    ) {
        let cache_config = crate::config::CacheConfig::default();
        (
            Arc::new(LayeredCache::new(cache_config.clone())),
            Arc::new(LayeredCache::new(cache_config)),
        )
    }

    #[tokio::test]
    async fn discover_sorts_by_session_then_window() {
        let mock = MockTmuxAdapter::new();
        mock.add_target("a:2".parse().unwrap(), vec!["x".into()]);
        mock.add_target("a:0".parse().unwrap(), vec!["x".into()]);
        mock.add_target("b:1".parse().unwrap(), vec!["x".into()]);

        let pool = pool_with(mock);
        let crash_config = CrashConfig::default();
        let discovery = AgentDiscovery::new(&crash_config).unwrap();
        let (session_cache, role_cache) = caches();
        let outcome = discovery.discover(&pool, &session_cache, &role_cache).await.unwrap();
        let rendered: Vec<String> = outcome.agents.iter().map(|a| a.target.to_string()).collect();
        assert_eq!(rendered, vec!["a:0", "a:2", "b:1"]);
    }

    #[tokio::test]
    async fn session_listing_is_reused_within_ttl() {
        let mock = MockTmuxAdapter::new();
        mock.add_target("a:0".parse().unwrap(), vec!["x".into()]);
        let pool = pool_with(mock);
        let crash_config = CrashConfig::default();
        let discovery = AgentDiscovery::new(&crash_config).unwrap();
        let (session_cache, role_cache) = caches();

        discovery.discover(&pool, &session_cache, &role_cache).await.unwrap();
        discovery.discover(&pool, &session_cache, &role_cache).await.unwrap();
        assert_eq!(session_cache.stats(Namespace::SessionInfo).hits, 1);
    }

    #[tokio::test]
    async fn missing_terminal_error_signature_list_allows_compile() {
        let crash_config = CrashConfig {
            terminal_error_signatures: vec![SignaturePattern {
                id: "exit".into(),
                pattern: "process exited".into(),
                is_regex: false,
            }],
            ..CrashConfig::default()
        };
        assert!(AgentDiscovery::new(&crash_config).is_ok());
    }
}
