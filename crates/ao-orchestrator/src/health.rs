use std::sync::Arc;
use std::time::Instant;

use ao_core::config::HealthConfig;
use ao_core::types::HealthState;
use ao_harness::shutdown::ShutdownSignal;
use ao_runtime::AdapterSet;
use ao_telemetry::metrics::{global_metrics, names};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventBus, OrchestratorEvent};
use crate::instance::Instance;
use crate::registry::Registry;

// ---------------------------------------------------------------------------
// HealthTracker: pure per-instance state machine
// ---------------------------------------------------------------------------

/// Consecutive-outcome counters plus the current state.
///
/// Recovery is hysteretic: Unhealthy only ever climbs to Degraded on a
/// success, and Degraded needs `recovery_successes` in a row for Healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTracker {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

impl HealthTracker {
    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Apply one probe outcome. Returns `(from, to)` when the state moved.
    pub fn observe(&mut self, ok: bool, cfg: &HealthConfig) -> Option<(HealthState, HealthState)> {
        let from = self.state;
        if ok {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.state = match from {
                HealthState::Unknown | HealthState::Healthy => HealthState::Healthy,
                HealthState::Unhealthy => HealthState::Degraded,
                HealthState::Degraded if self.consecutive_successes >= cfg.recovery_successes => {
                    HealthState::Healthy
                }
                HealthState::Degraded => HealthState::Degraded,
            };
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            let failures = self.consecutive_failures;
            self.state = if failures >= cfg.unhealthy_after {
                HealthState::Unhealthy
            } else {
                match from {
                    HealthState::Healthy | HealthState::Degraded if failures >= cfg.degraded_after => {
                        HealthState::Degraded
                    }
                    other => other,
                }
            };
        }
        (from != self.state).then_some((from, self.state))
    }
}

/// Health bookkeeping stored inside each [`Instance`].
#[derive(Debug, Default)]
pub(crate) struct HealthCell {
    tracker: HealthTracker,
    pub(crate) last_check: Option<DateTime<Utc>>,
    last_probe_at: Option<Instant>,
    unhealthy_since: Option<Instant>,
}

impl HealthCell {
    pub(crate) fn state(&self) -> HealthState {
        self.tracker.state()
    }

    fn record(&mut self, ok: bool, cfg: &HealthConfig) -> Option<(HealthState, HealthState)> {
        let now = Instant::now();
        self.last_check = Some(Utc::now());
        self.last_probe_at = Some(now);
        let change = self.tracker.observe(ok, cfg);
        match change {
            Some((_, HealthState::Unhealthy)) => self.unhealthy_since = Some(now),
            Some(_) => self.unhealthy_since = None,
            None => {}
        }
        change
    }

    /// Unhealthy instances wait out the cool-down between probes.
    fn is_due(&self, now: Instant, cfg: &HealthConfig) -> bool {
        match (self.state(), self.last_probe_at) {
            (HealthState::Unhealthy, Some(at)) => now.duration_since(at) >= cfg.unhealthy_cooldown(),
            _ => true,
        }
    }

    /// Time spent continuously Unhealthy, if currently Unhealthy.
    pub(crate) fn unhealthy_for(&self, now: Instant) -> Option<std::time::Duration> {
        self.unhealthy_since.map(|since| now.duration_since(since))
    }

    #[cfg(test)]
    pub(crate) fn force(&mut self, state: HealthState) {
        self.tracker.state = state;
        if state == HealthState::Unhealthy {
            self.unhealthy_since = Some(Instant::now());
        }
    }
}

// ---------------------------------------------------------------------------
// HealthProber
// ---------------------------------------------------------------------------

/// Runs `health_check` through the right adapter and feeds the outcome into
/// the instance's tracker.
pub struct HealthProber {
    adapters: AdapterSet,
    config: HealthConfig,
    events: EventBus,
}

impl HealthProber {
    pub fn new(adapters: AdapterSet, config: HealthConfig, events: EventBus) -> Self {
        Self {
            adapters,
            config,
            events,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn is_due(&self, instance: &Instance) -> bool {
        instance.health_cell().is_due(Instant::now(), &self.config)
    }

    pub async fn probe(&self, instance: &Instance) -> HealthState {
        let ok = match self.adapters.get(instance.runtime()) {
            Some(adapter) => match adapter
                .health_check(instance.handle(), self.config.probe_timeout())
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    debug!(instance_id = %instance.id(), error = %e, "health probe failed");
                    false
                }
            },
            None => {
                warn!(instance_id = %instance.id(), runtime = %instance.runtime(), "no adapter for instance runtime");
                false
            }
        };

        let (change, state) = {
            let mut cell = instance.health_cell();
            let change = cell.record(ok, &self.config);
            (change, cell.state())
        };

        if let Some((from, to)) = change {
            if to == HealthState::Unhealthy {
                warn!(agent_id = instance.agent_id(), instance_id = %instance.id(), %from, %to, "instance health changed");
            } else {
                info!(agent_id = instance.agent_id(), instance_id = %instance.id(), %from, %to, "instance health changed");
            }
            global_metrics().increment_counter(
                names::HEALTH_TRANSITIONS_TOTAL,
                &[("from", &from.to_string()), ("to", &to.to_string())],
            );
            self.events.publish(OrchestratorEvent::HealthChanged {
                agent_id: instance.agent_id().to_string(),
                instance_id: instance.id(),
                from,
                to,
            });
        }
        state
    }

    /// Probe a batch concurrently. Returns how many were probed.
    pub async fn probe_many(&self, instances: &[Arc<Instance>]) -> usize {
        join_all(instances.iter().map(|inst| self.probe(inst))).await.len()
    }
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

/// Periodic probing of every live instance the registry knows about.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<Registry>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// One pass: probe every non-draining instance that is due.
    pub async fn run_once(&self) -> usize {
        let prober = self.registry.prober();
        let due: Vec<Arc<Instance>> = self
            .registry
            .all_instances()
            .await
            .into_iter()
            .filter(|inst| !inst.is_draining() && prober.is_due(inst))
            .collect();
        let probed = prober.probe_many(&due).await;
        debug!(probed, "health pass complete");
        probed
    }

    pub fn spawn(self, signal: &ShutdownSignal) -> JoinHandle<()> {
        let period = self.registry.prober().config().interval();
        ao_harness::periodic::spawn_periodic("health-monitor", period, signal, move || {
            let monitor = self.clone();
            async move {
                monitor.run_once().await;
            }
        })
    }
}
