use std::sync::Arc;

use ao_core::config::AutoscalerConfig;
use ao_core::types::AutoscalePolicy;
use ao_harness::shutdown::ShutdownSignal;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::events::{EventBus, OrchestratorEvent};
use crate::registry::{Registry, ScaleTarget};

/// Replica count for one evaluation.
///
/// `ceil(current * utilization / target)`, moved at most `max_step` away
/// from `current`, then clamped into the policy bounds.
pub fn desired_replicas(
    current: usize,
    utilization: f64,
    policy: &AutoscalePolicy,
    max_step: usize,
) -> usize {
    let raw = if policy.target_utilization > 0.0 && utilization.is_finite() {
        (current as f64 * utilization.max(0.0) / policy.target_utilization).ceil() as usize
    } else {
        current
    };
    let stepped = if raw > current {
        raw.min(current.saturating_add(max_step))
    } else {
        raw.max(current.saturating_sub(max_step))
    };
    policy.clamp(stepped)
}

/// Utilisation of a deployment's admission capacity, in `[0, 1]`.
pub fn utilization(target: &ScaleTarget) -> f64 {
    let capacity = target.replicas * target.capacity_per_instance;
    if capacity == 0 {
        return 0.0;
    }
    (target.in_flight as f64 / capacity as f64).min(1.0)
}

/// A scale call the auto-scaler made.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleDecision {
    pub agent_id: String,
    pub from: usize,
    pub to: usize,
    pub utilization: f64,
}

/// Adjusts replica counts of deployments that carry an auto-scale policy.
pub struct AutoScaler {
    registry: Arc<Registry>,
    config: AutoscalerConfig,
    smoothed: DashMap<String, f64>,
}

impl AutoScaler {
    pub fn new(registry: Arc<Registry>, config: AutoscalerConfig) -> Self {
        Self {
            registry,
            config,
            smoothed: DashMap::new(),
        }
    }

    fn smooth(&self, agent_id: &str, sample: f64) -> f64 {
        let alpha = self.config.smoothing.clamp(0.0, 1.0);
        let mut entry = self.smoothed.entry(agent_id.to_string()).or_insert(sample);
        let next = alpha * sample + (1.0 - alpha) * *entry;
        *entry = next;
        next
    }

    /// Evaluate every auto-scaled deployment once.
    pub async fn evaluate(&self) -> Vec<ScaleDecision> {
        let targets = self.registry.scale_targets().await;
        self.smoothed
            .retain(|id, _| targets.iter().any(|t| &t.agent_id == id));

        let mut decisions = Vec::new();
        for target in targets {
            let util = self.smooth(&target.agent_id, utilization(&target));
            let desired = desired_replicas(target.replicas, util, &target.policy, self.config.max_step);
            debug!(agent_id = %target.agent_id, replicas = target.replicas, utilization = util, desired, "autoscale evaluation");
            if desired == target.replicas {
                continue;
            }
            info!(agent_id = %target.agent_id, from = target.replicas, to = desired, utilization = util, "autoscaling");
            match self.registry.scale(&target.agent_id, desired).await {
                Ok(_) => decisions.push(ScaleDecision {
                    agent_id: target.agent_id.clone(),
                    from: target.replicas,
                    to: desired,
                    utilization: util,
                }),
                Err(e) => warn!(agent_id = %target.agent_id, error = %e, "autoscale failed"),
            }
        }
        decisions
    }

    /// Run on the configured interval and whenever an instance saturates.
    pub fn spawn(self: Arc<Self>, events: &EventBus, signal: &ShutdownSignal) -> JoinHandle<()> {
        let rx = events.subscribe();
        let mut listener = signal.listener();
        let guard = signal.guard();
        let period = self.config.interval();
        tokio::spawn(async move {
            let _guard = guard;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            info!(loop_name = "autoscaler", period_ms = period.as_millis() as u64, "background loop started");

            loop {
                tokio::select! {
                    _ = listener.cancelled() => break,
                    _ = interval.tick() => {
                        self.evaluate().await;
                    }
                    msg = rx.recv_async() => match msg {
                        Ok(envelope) => {
                            if let OrchestratorEvent::AdmissionSaturated { agent_type, .. } = envelope.event {
                                // Collapse a burst of saturation events into one pass.
                                let burst = rx.try_iter().count();
                                debug!(%agent_type, burst, "saturation triggered evaluation");
                                self.evaluate().await;
                            }
                        }
                        Err(_) => {
                            warn!("event bus closed, autoscaler stopping");
                            break;
                        }
                    }
                }
            }
            info!(loop_name = "autoscaler", "background loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min: usize, max: usize) -> AutoscalePolicy {
        AutoscalePolicy {
            min_replicas: min,
            max_replicas: max,
            target_utilization: 0.5,
        }
    }

    #[test]
    fn scales_up_by_at_most_max_step() {
        // 4 replicas fully busy wants 8, step limits to 6.
        assert_eq!(desired_replicas(4, 1.0, &policy(1, 20), 2), 6);
        assert_eq!(desired_replicas(4, 0.75, &policy(1, 20), 10), 6);
    }

    #[test]
    fn scales_down_by_at_most_max_step() {
        assert_eq!(desired_replicas(10, 0.0, &policy(1, 20), 2), 8);
        assert_eq!(desired_replicas(10, 0.1, &policy(1, 20), 100), 2);
    }

    #[test]
    fn holds_steady_on_target() {
        assert_eq!(desired_replicas(4, 0.5, &policy(1, 20), 2), 4);
    }

    #[test]
    fn respects_policy_bounds() {
        assert_eq!(desired_replicas(3, 1.0, &policy(1, 4), 5), 4);
        assert_eq!(desired_replicas(2, 0.0, &policy(2, 4), 5), 2);
        assert_eq!(desired_replicas(0, 0.0, &policy(1, 4), 2), 1);
    }

    #[test]
    fn utilization_is_bounded() {
        let target = ScaleTarget {
            agent_id: "a".into(),
            agent_type: "echo".into(),
            replicas: 2,
            in_flight: 64,
            capacity_per_instance: 64,
            policy: policy(1, 4),
        };
        assert_eq!(utilization(&target), 0.5);
        let idle = ScaleTarget {
            replicas: 0,
            ..target
        };
        assert_eq!(utilization(&idle), 0.0);
    }
}
