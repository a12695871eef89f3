use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ao_core::types::{AgentDefinition, HealthState, InstanceId, InstanceView, RuntimeKind};
use ao_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use ao_runtime::InstanceHandle;
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::health::HealthCell;

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One running replica plus its live control-plane state.
///
/// Health is written only by the health prober (through `health_cell`),
/// breaker state only by dispatch outcomes.
pub struct Instance {
    handle: InstanceHandle,
    definition: Arc<AgentDefinition>,
    created_at: DateTime<Utc>,
    breaker: CircuitBreaker,
    health: Mutex<HealthCell>,
    in_flight: AtomicUsize,
    /// EMA of dispatch latency in ms as f64 bits; NaN until the first sample.
    latency_ema: AtomicU64,
    admission: Arc<Semaphore>,
    max_in_flight: usize,
    draining: AtomicBool,
}

impl Instance {
    pub fn new(
        handle: InstanceHandle,
        definition: Arc<AgentDefinition>,
        breaker: &CircuitBreakerConfig,
        max_in_flight: usize,
    ) -> Self {
        Self {
            handle,
            definition,
            created_at: Utc::now(),
            breaker: CircuitBreaker::new(breaker.clone()),
            health: Mutex::new(HealthCell::default()),
            in_flight: AtomicUsize::new(0),
            latency_ema: AtomicU64::new(f64::NAN.to_bits()),
            admission: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            draining: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.handle.id
    }

    pub fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.handle.kind
    }

    pub fn definition(&self) -> &Arc<AgentDefinition> {
        &self.definition
    }

    pub fn agent_id(&self) -> &str {
        &self.definition.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub(crate) fn health_cell(&self) -> MutexGuard<'_, HealthCell> {
        self.health.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn health(&self) -> HealthState {
        self.health_cell().state()
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.health_cell().last_check
    }

    // -- Load ---------------------------------------------------------------

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn is_saturated(&self) -> bool {
        self.in_flight() >= self.max_in_flight
    }

    pub fn ema_latency_ms(&self) -> Option<f64> {
        let v = f64::from_bits(self.latency_ema.load(Ordering::Relaxed));
        (!v.is_nan()).then_some(v)
    }

    pub fn record_latency(&self, sample_ms: f64, alpha: f64) {
        let _ = self
            .latency_ema
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let prev = f64::from_bits(bits);
                let next = if prev.is_nan() {
                    sample_ms
                } else {
                    alpha * sample_ms + (1.0 - alpha) * prev
                };
                Some(next.to_bits())
            });
    }

    /// Take an in-flight slot, or `None` if draining or at capacity.
    pub fn try_admit(self: &Arc<Self>) -> Option<InFlightGuard> {
        if self.is_draining() {
            return None;
        }
        let permit = self.admission.clone().try_acquire_owned().ok()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(InFlightGuard {
            _permit: permit,
            instance: self.clone(),
        })
    }

    // -- Selection ------------------------------------------------------------

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Healthy or Degraded, breaker admissible, not draining, not saturated.
    pub fn is_selectable(&self) -> bool {
        !self.is_draining()
            && self.health().is_routable()
            && self.breaker.is_admissible()
            && !self.is_saturated()
    }

    /// Mark draining and wait until every in-flight slot is returned or the
    /// deadline passes. Returns true when the instance went idle.
    ///
    /// Afterwards the admission gate is closed for good.
    pub(crate) async fn drain(&self, deadline: tokio::time::Instant) -> bool {
        self.mark_draining();
        let all = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        let idle = match tokio::time::timeout_at(deadline, self.admission.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                true
            }
            _ => false,
        };
        self.admission.close();
        idle
    }

    pub fn view(&self) -> InstanceView {
        let (health, last_check) = {
            let cell = self.health_cell();
            (cell.state(), cell.last_check)
        };
        InstanceView {
            id: self.id(),
            agent_id: self.definition.id.clone(),
            runtime: self.runtime(),
            target: self.handle.describe(),
            health,
            breaker: self.breaker.state(),
            in_flight: self.in_flight(),
            ema_latency_ms: self.ema_latency_ms(),
            draining: self.is_draining(),
            last_check,
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id())
            .field("agent_id", &self.definition.id)
            .field("runtime", &self.runtime())
            .field("in_flight", &self.in_flight())
            .field("draining", &self.is_draining())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// InFlightGuard
// ---------------------------------------------------------------------------

/// Holds one admission slot; released on drop, including cancellation.
#[derive(Debug)]
pub struct InFlightGuard {
    _permit: OwnedSemaphorePermit,
    instance: Arc<Instance>,
}

impl InFlightGuard {
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.instance.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ao_core::types::HealthState;
    use ao_runtime::{EchoAgent, HandleTarget};
    use semver::Version;
    use std::time::Duration;

    pub(crate) fn test_instance(max_in_flight: usize) -> Arc<Instance> {
        let def = AgentDefinition::new("echo-1", "echo", Version::new(1, 0, 0), RuntimeKind::InProcess);
        let handle = InstanceHandle::new(
            RuntimeKind::InProcess,
            HandleTarget::InProcess {
                handler: Arc::new(EchoAgent::default()),
            },
        );
        Arc::new(Instance::new(
            handle,
            Arc::new(def),
            &CircuitBreakerConfig::default(),
            max_in_flight,
        ))
    }

    pub(crate) fn force_health(instance: &Instance, state: HealthState) {
        instance.health_cell().force(state);
    }

    #[test]
    fn admission_is_bounded_and_released_on_drop() {
        let inst = test_instance(2);
        let a = inst.try_admit().unwrap();
        let _b = inst.try_admit().unwrap();
        assert!(inst.try_admit().is_none());
        assert!(inst.is_saturated());
        drop(a);
        assert_eq!(inst.in_flight(), 1);
        assert!(inst.try_admit().is_some());
    }

    #[test]
    fn latency_ema_starts_empty() {
        let inst = test_instance(4);
        assert_eq!(inst.ema_latency_ms(), None);
        inst.record_latency(100.0, 0.5);
        assert_eq!(inst.ema_latency_ms(), Some(100.0));
        inst.record_latency(0.0, 0.5);
        assert_eq!(inst.ema_latency_ms(), Some(50.0));
    }

    #[test]
    fn new_instances_are_not_selectable_until_probed() {
        let inst = test_instance(4);
        assert_eq!(inst.health(), HealthState::Unknown);
        assert!(!inst.is_selectable());
        force_health(&inst, HealthState::Healthy);
        assert!(inst.is_selectable());
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_work() {
        let inst = test_instance(4);
        let guard = inst.try_admit().unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        let idle = inst
            .drain(tokio::time::Instant::now() + Duration::from_secs(1))
            .await;
        assert!(idle);
        assert!(inst.is_draining());
        assert!(inst.try_admit().is_none());
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn drain_gives_up_at_deadline() {
        let inst = test_instance(4);
        let _held = inst.try_admit().unwrap();
        let idle = inst
            .drain(tokio::time::Instant::now() + Duration::from_millis(20))
            .await;
        assert!(!idle);
    }
}
