use std::sync::Arc;
use std::time::Duration;

use ao_core::config::RouterConfig;
use ao_core::constraints::CompiledConstraints;
use ao_core::types::{InstanceId, RuntimeKind, Task, TaskMetadata, TaskResult};
use ao_core::{OrchestratorError, Result};
use ao_harness::circuit_breaker::BreakerTransition;
use ao_runtime::RuntimeError;
use ao_telemetry::metrics::{global_metrics, names};
use ao_telemetry::tracing_setup::{attempt_span, task_span};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::balancer::LoadBalancer;
use crate::events::{EventBus, OrchestratorEvent};
use crate::instance::Instance;
use crate::registry::Registry;

// ---------------------------------------------------------------------------
// Dedup guard
// ---------------------------------------------------------------------------

/// Marks a task id as in dispatch; cleared on drop.
struct Claim<'a> {
    active: &'a DashMap<Uuid, ()>,
    id: Uuid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// TaskRouter
// ---------------------------------------------------------------------------

/// Dispatches tasks to instances with failover and breaker accounting.
pub struct TaskRouter {
    registry: Arc<Registry>,
    balancer: LoadBalancer,
    config: RouterConfig,
    events: EventBus,
    active: DashMap<Uuid, ()>,
}

impl TaskRouter {
    pub fn new(registry: Arc<Registry>, config: RouterConfig, events: EventBus) -> Self {
        Self {
            registry,
            balancer: LoadBalancer::new(config.strategy),
            config,
            events,
            active: DashMap::new(),
        }
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Number of tasks currently being dispatched.
    pub fn active_tasks(&self) -> usize {
        self.active.len()
    }

    fn claim(&self, id: Uuid) -> Result<Claim<'_>> {
        match self.active.entry(id) {
            Entry::Occupied(_) => Err(OrchestratorError::DuplicateTask(id)),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Claim {
                    active: &self.active,
                    id,
                })
            }
        }
    }

    /// Route `task` to an instance of `agent_type`.
    ///
    /// Dropping the returned future cancels the in-flight adapter call and
    /// releases its admission slot.
    pub async fn execute(&self, agent_type: &str, task: Task) -> Result<TaskResult> {
        let constraints = task
            .constraints
            .compile()
            .map_err(OrchestratorError::ConstraintMismatch)?;
        let _claim = self.claim(task.id)?;

        let (span, trace_id) = task_span(agent_type, &task.id, task.context.request_id.as_deref());
        let started = Instant::now();
        let outcome = self
            .dispatch(agent_type, &task, &constraints, &trace_id, started)
            .instrument(span)
            .await;

        let label = match &outcome {
            Ok(result) if result.success => "success",
            Ok(_) => "rejected",
            Err(e) => e.kind(),
        };
        let metrics = global_metrics();
        metrics.increment_counter(
            names::TASKS_TOTAL,
            &[("agent_type", agent_type), ("outcome", label)],
        );
        metrics.record_histogram(
            names::TASK_LATENCY_SECONDS,
            &[("agent_type", agent_type)],
            started.elapsed().as_secs_f64(),
        );
        outcome
    }

    async fn dispatch(
        &self,
        agent_type: &str,
        task: &Task,
        constraints: &CompiledConstraints,
        trace_id: &str,
        started: Instant,
    ) -> Result<TaskResult> {
        let budget = task
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_timeout());
        let deadline = started + budget;
        let max_attempts = self.config.retry_budget.saturating_add(1);

        let mut tried: Vec<InstanceId> = Vec::new();
        let mut pinned_runtime: Option<RuntimeKind> = None;
        let mut last_error: Option<OrchestratorError> = None;
        let mut attempts: u32 = 0;

        while attempts < max_attempts {
            let pool = self.registry.snapshot(agent_type).await;
            let cross = self.config.cross_runtime_failover;
            let selected = self.balancer.select(agent_type, &pool, constraints, |inst| {
                tried.contains(&inst.id())
                    || pinned_runtime.is_some_and(|kind| !cross && inst.runtime() != kind)
            });
            let instance = match selected {
                Ok(instance) => instance,
                // Nothing left to fail over to: report what went wrong last.
                Err(e) => return Err(last_error.unwrap_or(e)),
            };

            // Selection raced with other dispatches; skip without spending an attempt.
            let Some(slot) = instance.try_admit() else {
                tried.push(instance.id());
                continue;
            };
            if instance.is_saturated() {
                self.events.publish(OrchestratorEvent::AdmissionSaturated {
                    agent_type: agent_type.to_string(),
                    instance_id: instance.id(),
                });
            }
            let permit = match instance.breaker().try_acquire() {
                Ok(permit) => permit,
                Err(_) => {
                    tried.push(instance.id());
                    continue;
                }
            };
            self.note_breaker(&instance, permit.acquire_transition());

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OrchestratorError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }

            attempts += 1;
            pinned_runtime.get_or_insert(instance.runtime());
            let Some(adapter) = self.registry.adapters().get(instance.runtime()) else {
                return Err(OrchestratorError::ExecutionError {
                    instance_id: instance.id(),
                    reason: format!("no adapter for runtime `{}`", instance.runtime()),
                });
            };

            let attempt_started = Instant::now();
            let result = adapter
                .execute(instance.handle(), task, remaining)
                .instrument(attempt_span(trace_id, attempts, &instance.id()))
                .await;
            let attempt_ms = attempt_started.elapsed().as_secs_f64() * 1000.0;
            drop(slot);

            match result {
                Ok(output) => {
                    // Application-level rejections still mean the instance works.
                    self.note_breaker(&instance, permit.success());
                    instance.record_latency(attempt_ms, self.config.latency_ema_alpha);
                    global_metrics().increment_counter(
                        names::TASK_ATTEMPTS_TOTAL,
                        &[("agent_type", agent_type), ("outcome", "ok")],
                    );
                    debug!(attempt = attempts, instance_id = %instance.id(), success = output.success, "task dispatched");
                    let def = instance.definition();
                    let metadata = TaskMetadata {
                        latency_ms: started.elapsed().as_millis() as u64,
                        instance_id: instance.id(),
                        agent_id: def.id.clone(),
                        version: def.version.to_string(),
                        runtime: instance.runtime(),
                        attempts,
                    };
                    return Ok(TaskResult::from_output(output, metadata));
                }
                Err(e) => {
                    self.note_breaker(&instance, permit.failure());
                    global_metrics().increment_counter(
                        names::TASK_ATTEMPTS_TOTAL,
                        &[("agent_type", agent_type), ("outcome", "error")],
                    );
                    let err = runtime_failure(e, instance.id(), started);
                    warn!(attempt = attempts, instance_id = %instance.id(), error = %err, "dispatch attempt failed");
                    tried.push(instance.id());
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| OrchestratorError::NoAvailableAgent(agent_type.to_string())))
    }

    fn note_breaker(&self, instance: &Instance, change: Option<BreakerTransition>) {
        let Some(t) = change else {
            return;
        };
        global_metrics().increment_counter(
            names::BREAKER_TRANSITIONS_TOTAL,
            &[("to", &t.to.to_string())],
        );
        self.events.publish(OrchestratorEvent::BreakerChanged {
            agent_id: instance.agent_id().to_string(),
            instance_id: instance.id(),
            from: t.from,
            to: t.to,
        });
    }
}

/// Collapse backend failures into the two retryable API errors.
fn runtime_failure(err: RuntimeError, instance_id: InstanceId, started: Instant) -> OrchestratorError {
    match err {
        RuntimeError::Timeout(_) => OrchestratorError::Timeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
        },
        other => OrchestratorError::ExecutionError {
            instance_id,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_timeouts_map_to_timeout() {
        let id = Uuid::new_v4();
        let err = runtime_failure(RuntimeError::Timeout(Duration::from_millis(5)), id, Instant::now());
        assert!(matches!(err, OrchestratorError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn other_runtime_failures_map_to_execution_error() {
        let id = Uuid::new_v4();
        let err = runtime_failure(RuntimeError::Execution("refused".into()), id, Instant::now());
        match err {
            OrchestratorError::ExecutionError { instance_id, reason } => {
                assert_eq!(instance_id, id);
                assert!(reason.contains("refused"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
