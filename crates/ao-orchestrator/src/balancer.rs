use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ao_core::config::BalanceStrategy;
use ao_core::constraints::CompiledConstraints;
use ao_core::{OrchestratorError, Result};
use dashmap::DashMap;
use rand::Rng;

use crate::instance::Instance;

/// Picks one instance per dispatch attempt.
///
/// Cursors are kept per agent type so round-robin fairness holds within a
/// type regardless of traffic to others.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: BalanceStrategy,
    cursors: DashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(strategy: BalanceStrategy) -> Self {
        Self {
            strategy,
            cursors: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    fn next_cursor(&self, agent_type: &str) -> usize {
        if let Some(cursor) = self.cursors.get(agent_type) {
            return cursor.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors
            .entry(agent_type.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Filter `pool` down to selectable candidates and pick one.
    ///
    /// `skip` removes instances the caller must not use (already tried, or
    /// on a different runtime kind during failover).
    pub fn select(
        &self,
        agent_type: &str,
        pool: &[Arc<Instance>],
        constraints: &CompiledConstraints,
        skip: impl Fn(&Instance) -> bool,
    ) -> Result<Arc<Instance>> {
        if pool.is_empty() {
            return Err(OrchestratorError::NoAvailableAgent(agent_type.to_string()));
        }

        let matching: Vec<&Arc<Instance>> = pool
            .iter()
            .filter(|inst| constraints.matches(inst.definition()))
            .collect();
        if matching.is_empty() {
            return Err(OrchestratorError::ConstraintMismatch(format!(
                "no instance of `{agent_type}` satisfies the task constraints"
            )));
        }

        // Routable and not draining; the breaker decides the rest.
        let eligible: Vec<&Arc<Instance>> = matching
            .into_iter()
            .filter(|inst| !skip(inst.as_ref()) && !inst.is_draining() && inst.health().is_routable())
            .collect();
        if eligible.is_empty() {
            return Err(OrchestratorError::NoAvailableAgent(agent_type.to_string()));
        }
        if eligible.iter().all(|inst| !inst.breaker().is_admissible()) {
            return Err(OrchestratorError::CircuitOpen(agent_type.to_string()));
        }

        let candidates: Vec<Arc<Instance>> = eligible
            .into_iter()
            .filter(|inst| inst.breaker().is_admissible() && !inst.is_saturated())
            .cloned()
            .collect();

        self.pick(agent_type, &candidates)
            .ok_or_else(|| OrchestratorError::NoAvailableAgent(agent_type.to_string()))
    }

    /// Apply the strategy to an already-filtered candidate list.
    pub fn pick(&self, agent_type: &str, candidates: &[Arc<Instance>]) -> Option<Arc<Instance>> {
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self.strategy {
            BalanceStrategy::RoundRobin => {
                &candidates[self.next_cursor(agent_type) % candidates.len()]
            }
            BalanceStrategy::Random => {
                &candidates[rand::thread_rng().gen_range(0..candidates.len())]
            }
            BalanceStrategy::LeastLoaded => {
                let min = candidates.iter().map(|i| i.in_flight()).min()?;
                let tied: Vec<&Arc<Instance>> =
                    candidates.iter().filter(|i| i.in_flight() == min).collect();
                tied[self.next_cursor(agent_type) % tied.len()]
            }
            BalanceStrategy::Latency => {
                let score = |i: &Instance| i.ema_latency_ms().unwrap_or(0.0);
                let min = candidates
                    .iter()
                    .map(|i| score(i.as_ref()))
                    .fold(f64::INFINITY, f64::min);
                let tied: Vec<&Arc<Instance>> =
                    candidates.iter().filter(|i| score(i.as_ref()) <= min).collect();
                tied[self.next_cursor(agent_type) % tied.len()]
            }
        };
        Some(chosen.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::{force_health, test_instance};
    use ao_core::constraints::Constraints;
    use ao_core::types::HealthState;
    use std::collections::HashMap;

    fn healthy_pool(n: usize) -> Vec<Arc<Instance>> {
        (0..n)
            .map(|_| {
                let inst = test_instance(8);
                force_health(&inst, HealthState::Healthy);
                inst
            })
            .collect()
    }

    fn unconstrained() -> CompiledConstraints {
        Constraints::default().compile().unwrap()
    }

    #[test]
    fn round_robin_is_fair() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let pool = healthy_pool(3);
        let mut counts: HashMap<_, usize> = HashMap::new();
        for k in 1..=20 {
            let inst = lb.select("echo", &pool, &unconstrained(), |_| false).unwrap();
            *counts.entry(inst.id()).or_default() += 1;
            let max = pool.iter().map(|i| counts.get(&i.id()).copied().unwrap_or(0)).max().unwrap();
            let min = pool.iter().map(|i| counts.get(&i.id()).copied().unwrap_or(0)).min().unwrap();
            assert!(max - min <= 1, "after {k} picks: {counts:?}");
        }
    }

    #[test]
    fn least_loaded_prefers_idle() {
        let lb = LoadBalancer::new(BalanceStrategy::LeastLoaded);
        let pool = healthy_pool(2);
        let _busy = pool[0].try_admit().unwrap();
        for _ in 0..4 {
            let inst = lb.select("echo", &pool, &unconstrained(), |_| false).unwrap();
            assert_eq!(inst.id(), pool[1].id());
        }
    }

    #[test]
    fn latency_treats_unsampled_as_fastest() {
        let lb = LoadBalancer::new(BalanceStrategy::Latency);
        let pool = healthy_pool(2);
        pool[0].record_latency(40.0, 0.2);
        let inst = lb.select("echo", &pool, &unconstrained(), |_| false).unwrap();
        assert_eq!(inst.id(), pool[1].id());
        pool[1].record_latency(90.0, 0.2);
        let inst = lb.select("echo", &pool, &unconstrained(), |_| false).unwrap();
        assert_eq!(inst.id(), pool[0].id());
    }

    #[test]
    fn all_open_breakers_is_circuit_open() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let pool = healthy_pool(2);
        for inst in &pool {
            for _ in 0..5 {
                inst.breaker().try_acquire().unwrap().failure();
            }
        }
        let err = lb.select("echo", &pool, &unconstrained(), |_| false).unwrap_err();
        assert!(matches!(err, OrchestratorError::CircuitOpen(_)));
    }

    #[test]
    fn unhealthy_and_draining_are_not_available() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let pool = healthy_pool(2);
        force_health(&pool[0], HealthState::Unhealthy);
        pool[1].mark_draining();
        let err = lb.select("echo", &pool, &unconstrained(), |_| false).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoAvailableAgent(_)));

        let err = lb.select("echo", &[], &unconstrained(), |_| false).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoAvailableAgent(_)));
    }

    #[test]
    fn constraint_mismatch_is_distinguished() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let pool = healthy_pool(1);
        let wants_v2 = Constraints::default().with_version(">=2.0.0").compile().unwrap();
        let err = lb.select("echo", &pool, &wants_v2, |_| false).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConstraintMismatch(_)));

        let wants_cap = Constraints::default().with_capability("gpu").compile().unwrap();
        let err = lb.select("echo", &pool, &wants_cap, |_| false).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConstraintMismatch(_)));
    }

    #[test]
    fn skip_excludes_tried_instances() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let pool = healthy_pool(2);
        let first = pool[0].id();
        for _ in 0..4 {
            let inst = lb.select("echo", &pool, &unconstrained(), |i| i.id() == first).unwrap();
            assert_ne!(inst.id(), first);
        }
    }
}
