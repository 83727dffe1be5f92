//! Configuration document (`spec.md` §6): every tunable the engine reads, with
//! the defaults named in the spec baked in as `#[serde(default = ...)]`
//! functions so there is exactly one place each default lives.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn d_cycle_interval() -> u64 {
    10
}
fn d_strategy() -> String {
    "concurrent".to_string()
}
fn d_max_parallel() -> usize {
    20
}
fn d_saturation_window() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "d_cycle_interval")]
    pub cycle_interval_secs: u64,
    #[serde(default = "d_strategy")]
    pub strategy: String,
    #[serde(default = "d_max_parallel")]
    pub max_parallel: usize,
    /// How long the pool must stay continuously saturated before the
    /// scheduler halves `max_parallel` (`spec.md` §5). Not grouped under
    /// `pool` because it's a scheduler-side backpressure policy, not a pool
    /// sizing parameter.
    #[serde(default = "d_saturation_window")]
    pub saturation_window_secs: u64,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub crash: CrashConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, crate::error::CoreError> {
        toml::from_str(s).map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cycle_interval_secs: d_cycle_interval(),
            strategy: d_strategy(),
            max_parallel: d_max_parallel(),
            saturation_window_secs: d_saturation_window(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            crash: CrashConfig::default(),
            recovery: RecoveryConfig::default(),
            notifications: NotificationConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

fn d_pool_min() -> usize {
    5
}
fn d_pool_max() -> usize {
    20
}
fn d_acquire_timeout() -> u64 {
    5
}
fn d_max_idle() -> u64 {
    60
}
fn d_max_total_age() -> u64 {
    600
}
fn d_sweep_interval() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "d_pool_min")]
    pub min: usize,
    #[serde(default = "d_pool_max")]
    pub max: usize,
    #[serde(default = "d_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "d_max_idle")]
    pub max_idle_secs: u64,
    #[serde(default = "d_max_total_age")]
    pub max_total_age_secs: u64,
    #[serde(default = "d_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: d_pool_min(),
            max: d_pool_max(),
            acquire_timeout_secs: d_acquire_timeout(),
            max_idle_secs: d_max_idle(),
            max_total_age_secs: d_max_total_age(),
            sweep_interval_secs: d_sweep_interval(),
        }
    }
}

fn d_pane_ttl() -> u64 {
    10
}
fn d_status_ttl() -> u64 {
    30
}
fn d_session_ttl() -> u64 {
    60
}
fn d_config_ttl() -> u64 {
    300
}
fn d_max_entries() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "d_pane_ttl")]
    pub pane_content_ttl_secs: u64,
    #[serde(default = "d_status_ttl")]
    pub agent_status_ttl_secs: u64,
    #[serde(default = "d_session_ttl")]
    pub session_info_ttl_secs: u64,
    #[serde(default = "d_config_ttl")]
    pub config_ttl_secs: u64,
    #[serde(default = "d_max_entries")]
    pub max_entries_per_namespace: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pane_content_ttl_secs: d_pane_ttl(),
            agent_status_ttl_secs: d_status_ttl(),
            session_info_ttl_secs: d_session_ttl(),
            config_ttl_secs: d_config_ttl(),
            max_entries_per_namespace: d_max_entries(),
        }
    }
}

fn d_stuck_threshold() -> u16 {
    6
}
fn d_missing_threshold() -> u16 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashConfig {
    #[serde(default = "d_stuck_threshold")]
    pub stuck_threshold: u16,
    #[serde(default = "d_missing_threshold")]
    pub missing_threshold: u16,
    #[serde(default)]
    pub terminal_error_signatures: Vec<SignaturePattern>,
    #[serde(default)]
    pub role_signatures: Vec<RoleSignature>,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: d_stuck_threshold(),
            missing_threshold: d_missing_threshold(),
            terminal_error_signatures: Vec::new(),
            role_signatures: Vec::new(),
        }
    }
}

/// A named, literal-or-regex substring pattern, matched in declaration order
/// (`spec.md` §9: "ordered list of `(terminal_error_signature, id)` pairs").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturePattern {
    pub id: String,
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSignature {
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    pub role: crate::model::AgentRole,
}

fn d_grace_period() -> u64 {
    180
}
fn d_cooldown_base() -> u64 {
    30
}
fn d_cooldown_growth() -> f64 {
    2.0
}
fn d_cooldown_cap_factor() -> f64 {
    8.0
}
fn d_max_attempts() -> u8 {
    3
}
fn d_confirm_samples() -> u8 {
    2
}
fn d_pm_launch_command() -> String {
    "claude".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "d_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "d_cooldown_base")]
    pub cooldown_base_secs: u64,
    #[serde(default = "d_cooldown_growth")]
    pub cooldown_growth: f64,
    #[serde(default = "d_cooldown_cap_factor")]
    pub cooldown_cap_factor: f64,
    #[serde(default = "d_max_attempts")]
    pub max_attempts: u8,
    #[serde(default = "d_confirm_samples")]
    pub confirm_samples: u8,
    #[serde(default = "d_pm_launch_command")]
    pub pm_launch_command: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: d_grace_period(),
            cooldown_base_secs: d_cooldown_base(),
            cooldown_growth: d_cooldown_growth(),
            cooldown_cap_factor: d_cooldown_cap_factor(),
            max_attempts: d_max_attempts(),
            confirm_samples: d_confirm_samples(),
            pm_launch_command: d_pm_launch_command(),
        }
    }
}

fn d_queue_capacity() -> usize {
    10_000
}
fn d_dedupe_window() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "d_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "d_dedupe_window")]
    pub dedupe_window_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: d_queue_capacity(),
            dedupe_window_secs: d_dedupe_window(),
        }
    }
}

fn d_persist_path() -> String {
    "tracker.snapshot".to_string()
}
fn d_persist_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "d_persist_path")]
    pub path: String,
    #[serde(default = "d_persist_interval")]
    pub persist_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: d_persist_path(),
            persist_interval_secs: d_persist_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.cycle_interval_secs, 10);
        assert_eq!(c.saturation_window_secs, 30);
        assert_eq!(c.pool.min, 5);
        assert_eq!(c.pool.max, 20);
        assert_eq!(c.cache.pane_content_ttl_secs, 10);
        assert_eq!(c.crash.stuck_threshold, 6);
        assert_eq!(c.recovery.grace_period_secs, 180);
        assert_eq!(c.recovery.max_attempts, 3);
        assert_eq!(c.notifications.queue_capacity, 10_000);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml = r#"
            cycle_interval_secs = 5

            [recovery]
            max_attempts = 5
        "#;
        let c = Config::from_toml_str(toml).unwrap();
        assert_eq!(c.cycle_interval_secs, 5);
        assert_eq!(c.recovery.max_attempts, 5);
        assert_eq!(c.recovery.grace_period_secs, 180);
    }

    #[test]
    fn cycle_interval_floors_at_one_second() {
        let mut c = Config::default();
        c.cycle_interval_secs = 0;
        assert_eq!(c.cycle_interval(), Duration::from_secs(1));
    }
}
