use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AgentDefinition, AutoscalePolicy, ResourceLimits};

/// Top-level configuration loaded from `~/.agent-orchestrator/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Agents registered and deployed when the daemon starts.
    #[serde(default)]
    pub agents: Vec<AgentBootstrap>,
}

impl Config {
    /// Load config from the default path, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        tracing::debug!(path = %path.display(), agents = cfg.agents.len(), "config loaded");
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.health.validate()?;
        self.breaker.validate()?;
        self.router.validate()?;
        self.autoscaler.validate()?;
        for agent in &self.agents {
            agent.validate()?;
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agent-orchestrator")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    /// How long shutdown waits for background loops to acknowledge.
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
            log_level: default_log_level(),
            log_json: false,
            shutdown_drain_ms: default_shutdown_drain_ms(),
        }
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    7420
}
fn default_log_level() -> String {
    "info".into()
}
fn default_shutdown_drain_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Consecutive probe failures that move Healthy to Degraded.
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    /// Consecutive probe failures that move an instance to Unhealthy.
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
    /// Consecutive probe successes needed to climb back to Healthy.
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,
    /// Minimum gap between probes of an Unhealthy instance.
    #[serde(default = "default_unhealthy_cooldown_ms")]
    pub unhealthy_cooldown_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            degraded_after: default_degraded_after(),
            unhealthy_after: default_unhealthy_after(),
            recovery_successes: default_recovery_successes(),
            unhealthy_cooldown_ms: default_unhealthy_cooldown_ms(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn unhealthy_cooldown(&self) -> Duration {
        Duration::from_millis(self.unhealthy_cooldown_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(invalid("health.interval_ms must be greater than 0"));
        }
        if self.degraded_after == 0 {
            return Err(invalid("health.degraded_after must be at least 1"));
        }
        if self.unhealthy_after < self.degraded_after {
            return Err(invalid(format!(
                "health.unhealthy_after ({}) must be >= health.degraded_after ({})",
                self.unhealthy_after, self.degraded_after
            )));
        }
        if self.recovery_successes == 0 {
            return Err(invalid("health.recovery_successes must be at least 1"));
        }
        Ok(())
    }
}

fn default_health_interval_ms() -> u64 {
    5_000
}
fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_degraded_after() -> u32 {
    1
}
fn default_unhealthy_after() -> u32 {
    3
}
fn default_recovery_successes() -> u32 {
    3
}
fn default_unhealthy_cooldown_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failures older than this window no longer count toward the threshold.
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        if self.failure_window_ms == 0 {
            return Err(invalid("breaker.failure_window_ms must be greater than 0"));
        }
        Ok(())
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_ms() -> u64 {
    60_000
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}

/// Selection strategy used by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Random,
    Latency,
}

impl fmt::Display for BalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BalanceStrategy::RoundRobin => "round_robin",
            BalanceStrategy::LeastLoaded => "least_loaded",
            BalanceStrategy::Random => "random",
            BalanceStrategy::Latency => "latency",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub strategy: BalanceStrategy,
    /// Retries after the first attempt.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Deadline applied when a task carries no timeout of its own.
    #[serde(default = "default_task_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub cross_runtime_failover: bool,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_per_instance: usize,
    /// Weight of the newest sample in the per-instance latency EMA.
    #[serde(default = "default_latency_alpha")]
    pub latency_ema_alpha: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: BalanceStrategy::default(),
            retry_budget: default_retry_budget(),
            default_timeout_ms: default_task_timeout_ms(),
            cross_runtime_failover: false,
            max_in_flight_per_instance: default_max_in_flight(),
            latency_ema_alpha: default_latency_alpha(),
        }
    }
}

impl RouterConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight_per_instance == 0 {
            return Err(invalid("router.max_in_flight_per_instance must be at least 1"));
        }
        if !(self.latency_ema_alpha > 0.0 && self.latency_ema_alpha <= 1.0) {
            return Err(invalid("router.latency_ema_alpha must be in (0, 1]"));
        }
        if self.default_timeout_ms == 0 {
            return Err(invalid("router.default_timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}

fn default_retry_budget() -> u32 {
    2
}
fn default_task_timeout_ms() -> u64 {
    30_000
}
fn default_max_in_flight() -> usize {
    64
}
fn default_latency_alpha() -> f64 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_autoscale_interval_ms")]
    pub interval_ms: u64,
    /// Largest replica change applied in one evaluation.
    #[serde(default = "default_max_step")]
    pub max_step: usize,
    /// Weight of the newest utilisation sample in the EMA.
    #[serde(default = "default_utilization_alpha")]
    pub smoothing: f64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_autoscale_interval_ms(),
            max_step: default_max_step(),
            smoothing: default_utilization_alpha(),
        }
    }
}

impl AutoscalerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_step == 0 {
            return Err(invalid("autoscaler.max_step must be at least 1"));
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(invalid("autoscaler.smoothing must be in (0, 1]"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_autoscale_interval_ms() -> u64 {
    15_000
}
fn default_max_step() -> usize {
    2
}
fn default_utilization_alpha() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Upper bound on waiting for in-flight tasks before stopping a draining instance.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Grace period handed to `stop` before force-termination.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Unhealthy instances older than this are replaced by reconciliation.
    #[serde(default = "default_unhealthy_eviction_ms")]
    pub unhealthy_eviction_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            unhealthy_eviction_ms: default_unhealthy_eviction_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn unhealthy_eviction(&self) -> Duration {
        Duration::from_millis(self.unhealthy_eviction_ms)
    }
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}
fn default_stop_grace_ms() -> u64 {
    5_000
}
fn default_reconcile_interval_ms() -> u64 {
    10_000
}
fn default_unhealthy_eviction_ms() -> u64 {
    120_000
}

/// Knobs shared by the HTTP, container and process backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Transport-level retries on connection failure.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    /// How long a container or process may take to answer its first health check.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connect_retries: default_connect_retries(),
            connect_backoff_ms: default_connect_backoff_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            docker_bin: default_docker_bin(),
        }
    }
}

fn default_connect_retries() -> u32 {
    3
}
fn default_connect_backoff_ms() -> u64 {
    100
}
fn default_startup_timeout_ms() -> u64 {
    10_000
}
fn default_docker_bin() -> String {
    "docker".into()
}

/// One `[[agents]]` entry: registered and deployed at daemon start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBootstrap {
    #[serde(flatten)]
    pub definition: AgentDefinition,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub autoscale: Option<AutoscalePolicy>,
}

impl AgentBootstrap {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.definition.id.trim().is_empty() {
            return Err(invalid("agents[].id must not be empty"));
        }
        if let Some(policy) = &self.autoscale {
            policy
                .validate()
                .map_err(|e| invalid(format!("agents.{}.autoscale: {e}", self.definition.id)))?;
        }
        Ok(())
    }
}

fn default_replicas() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.health.interval(), Duration::from_secs(5));
        assert_eq!(cfg.health.degraded_after, 1);
        assert_eq!(cfg.health.unhealthy_after, 3);
        assert_eq!(cfg.health.recovery_successes, 3);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.reset_timeout_ms, 30_000);
        assert_eq!(cfg.router.retry_budget, 2);
        assert_eq!(cfg.router.max_in_flight_per_instance, 64);
        assert!(!cfg.router.cross_runtime_failover);
        assert_eq!(cfg.autoscaler.interval(), Duration::from_secs(15));
        assert_eq!(cfg.autoscaler.max_step, 2);
        cfg.validate().expect("defaults validate");
    }

    #[test]
    fn inverted_health_thresholds_fail_validation() {
        let mut cfg = Config::default();
        cfg.health.degraded_after = 4;
        cfg.health.unhealthy_after = 2;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unhealthy_after"));
    }
}
