use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use ao_core::config::{Config, RegistryConfig};
use ao_core::types::{
    AgentDefinition, AgentStatus, AgentSummary, AutoscalePolicy, DeploymentStatus, DeploymentView,
    HealthReport, HealthState, InstanceId, ResourceLimits,
};
use ao_core::{OrchestratorError, Result};
use ao_harness::circuit_breaker::CircuitBreakerConfig;
use ao_runtime::{AdapterSet, RuntimeAdapter, RuntimeError, StartSpec};
use ao_telemetry::metrics::{global_metrics, names};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, OrchestratorEvent};
use crate::health::HealthProber;
use crate::instance::Instance;

// ---------------------------------------------------------------------------
// Public request / response types
// ---------------------------------------------------------------------------

/// Arguments to [`Registry::deploy`].
#[derive(Debug, Clone, Default)]
pub struct DeploySpec {
    pub replicas: usize,
    pub resources: ResourceLimits,
    pub autoscale: Option<AutoscalePolicy>,
}

impl DeploySpec {
    pub fn replicas(replicas: usize) -> Self {
        Self {
            replicas,
            ..Self::default()
        }
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_autoscale(mut self, policy: AutoscalePolicy) -> Self {
        self.autoscale = Some(policy);
        self
    }
}

/// Definition plus current deployment, as returned by `get`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentDetail {
    pub definition: AgentDefinition,
    pub deployment: Option<DeploymentView>,
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub evicted: usize,
    pub started: usize,
    pub failed: usize,
}

/// Load summary for one auto-scaled deployment.
#[derive(Debug, Clone)]
pub struct ScaleTarget {
    pub agent_id: String,
    pub agent_type: String,
    pub replicas: usize,
    pub in_flight: usize,
    pub capacity_per_instance: usize,
    pub policy: AutoscalePolicy,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Deployment {
    id: Uuid,
    agent_id: String,
    desired_replicas: usize,
    instances: Vec<Arc<Instance>>,
    resources: ResourceLimits,
    autoscale: Option<AutoscalePolicy>,
    status: DeploymentStatus,
    startup_failures: u32,
    next_replica_index: usize,
}

impl Deployment {
    fn live(&self) -> impl Iterator<Item = &Arc<Instance>> {
        self.instances.iter().filter(|i| !i.is_draining())
    }

    fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Recompute status; returns the new status when it changed.
    fn settle(&mut self) -> Option<DeploymentStatus> {
        let next = if self.live_count() >= self.desired_replicas {
            DeploymentStatus::Healthy
        } else {
            DeploymentStatus::Degraded
        };
        let changed = next != self.status;
        self.status = next;
        changed.then_some(next)
    }

    fn view(&self) -> DeploymentView {
        DeploymentView {
            deployment_id: self.id,
            agent_id: self.agent_id.clone(),
            desired_replicas: self.desired_replicas,
            status: self.status,
            startup_failures: self.startup_failures,
            resources: self.resources.clone(),
            autoscale: self.autoscale.clone(),
            instances: self.instances.iter().map(|i| i.view()).collect(),
        }
    }
}

/// All deployments of one agent type, guarded together.
#[derive(Default)]
struct TypePool {
    deployments: BTreeMap<String, Deployment>,
}

type PoolRef = Arc<RwLock<TypePool>>;

#[derive(Default)]
struct StartRound {
    started: Vec<Arc<Instance>>,
    failures: Vec<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owns agent definitions, deployments and their instances.
///
/// Each agent type has its own pool lock. Mutations of one agent are
/// serialized by a per-agent operation lock, and no adapter call is made
/// while a pool lock is held.
pub struct Registry {
    config: RegistryConfig,
    breaker: CircuitBreakerConfig,
    max_in_flight: usize,
    adapters: AdapterSet,
    prober: HealthProber,
    events: EventBus,
    definitions: DashMap<String, Arc<AgentDefinition>>,
    pools: DashMap<String, PoolRef>,
    ops: DashMap<String, Arc<Mutex<()>>>,
}

impl Registry {
    pub fn new(config: &Config, adapters: AdapterSet, events: EventBus) -> Self {
        Self {
            config: config.registry.clone(),
            breaker: CircuitBreakerConfig::from(&config.breaker),
            max_in_flight: config.router.max_in_flight_per_instance.max(1),
            prober: HealthProber::new(adapters.clone(), config.health.clone(), events.clone()),
            adapters,
            events,
            definitions: DashMap::new(),
            pools: DashMap::new(),
            ops: DashMap::new(),
        }
    }

    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn definition(&self, id: &str) -> Option<Arc<AgentDefinition>> {
        self.definitions.get(id).map(|d| d.value().clone())
    }

    fn require_definition(&self, id: &str) -> Result<Arc<AgentDefinition>> {
        self.definition(id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(id.to_string()))
    }

    fn ops_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.ops.entry(id.to_string()).or_default().clone()
    }

    fn pool(&self, agent_type: &str) -> Option<PoolRef> {
        self.pools.get(agent_type).map(|p| p.value().clone())
    }

    fn pool_or_create(&self, agent_type: &str) -> PoolRef {
        self.pools.entry(agent_type.to_string()).or_default().clone()
    }

    fn adapter_for(&self, def: &AgentDefinition) -> Result<Arc<dyn RuntimeAdapter>> {
        self.adapters.get(def.runtime).ok_or_else(|| {
            OrchestratorError::InvalidDefinition(format!(
                "no runtime adapter for `{}`",
                def.runtime
            ))
        })
    }

    // -- Registration -------------------------------------------------------

    /// Validate and store a definition. Returns its id.
    pub fn register(&self, definition: AgentDefinition) -> Result<String> {
        if definition.id.trim().is_empty() {
            return Err(OrchestratorError::InvalidDefinition("id must not be empty".into()));
        }
        if definition.agent_type.trim().is_empty() {
            return Err(OrchestratorError::InvalidDefinition("type must not be empty".into()));
        }
        let adapter = self.adapter_for(&definition)?;
        adapter.validate(&definition).map_err(|e| match e {
            RuntimeError::InvalidDefinition(msg) => OrchestratorError::InvalidDefinition(msg),
            other => OrchestratorError::InvalidDefinition(other.to_string()),
        })?;

        let id = definition.id.clone();
        let agent_type = definition.agent_type.clone();
        match self.definitions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(OrchestratorError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(definition));
            }
        }

        info!(agent_id = %id, agent_type = %agent_type, "agent registered");
        self.events.publish(OrchestratorEvent::AgentRegistered {
            agent_id: id.clone(),
            agent_type,
        });
        Ok(id)
    }

    // -- Deployment -----------------------------------------------------------

    /// Create the deployment for `id`, or re-target an existing one.
    ///
    /// Replica start failures are recorded and leave the deployment
    /// degraded; only a new deployment whose every replica failed returns
    /// `StartupError`. The deployment is kept either way so reconciliation
    /// retries it.
    pub async fn deploy(&self, id: &str, spec: DeploySpec) -> Result<DeploymentView> {
        let def = self.require_definition(id)?;
        if let Some(policy) = &spec.autoscale {
            policy
                .validate()
                .map_err(|e| OrchestratorError::InvalidDefinition(format!("autoscale: {e}")))?;
        }
        let replicas = match &spec.autoscale {
            Some(policy) => policy.clamp(spec.replicas),
            None => spec.replicas,
        };

        let lock = self.ops_lock(id);
        let _op = lock.lock().await;
        let pool = self.pool_or_create(&def.agent_type);

        let existing = {
            let mut guard = pool.write().await;
            match guard.deployments.get_mut(id) {
                Some(dep) => {
                    dep.resources = spec.resources.clone();
                    dep.autoscale = spec.autoscale.clone();
                    true
                }
                None => {
                    guard.deployments.insert(
                        id.to_string(),
                        Deployment {
                            id: Uuid::new_v4(),
                            agent_id: id.to_string(),
                            desired_replicas: replicas,
                            instances: Vec::new(),
                            resources: spec.resources.clone(),
                            autoscale: spec.autoscale.clone(),
                            status: DeploymentStatus::Healthy,
                            startup_failures: 0,
                            next_replica_index: 0,
                        },
                    );
                    false
                }
            }
        };

        if existing {
            debug!(agent_id = %id, replicas, "deployment exists, re-targeting");
            return self.scale_locked(&def, &pool, replicas).await;
        }

        info!(agent_id = %id, replicas, runtime = %def.runtime, "deploying agent");
        let round = self.grow(&def, &pool, replicas).await?;
        let view = self.deployment_view(&pool, id).await?;
        if replicas > 0 && round.started.is_empty() {
            let reason = round.failures.first().cloned().unwrap_or_default();
            return Err(OrchestratorError::StartupError(reason));
        }
        Ok(view)
    }

    /// Reconcile the instance count of a deployment to `replicas`.
    pub async fn scale(&self, id: &str, replicas: usize) -> Result<DeploymentView> {
        let def = self.require_definition(id)?;
        let lock = self.ops_lock(id);
        let _op = lock.lock().await;
        let pool = self
            .pool(&def.agent_type)
            .ok_or_else(|| OrchestratorError::DeploymentNotFound(id.to_string()))?;
        self.scale_locked(&def, &pool, replicas).await
    }

    /// Caller holds the agent's ops lock.
    async fn scale_locked(
        &self,
        def: &Arc<AgentDefinition>,
        pool: &PoolRef,
        replicas: usize,
    ) -> Result<DeploymentView> {
        let id = def.id.as_str();
        let (live, victims) = {
            let mut guard = pool.write().await;
            let dep = guard
                .deployments
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::DeploymentNotFound(id.to_string()))?;
            dep.desired_replicas = replicas;
            let live = dep.live_count();
            let victims = if live > replicas {
                let mut ranked: Vec<Arc<Instance>> = dep.live().cloned().collect();
                ranked.sort_by_key(|i| (retire_rank(i.health()), i.in_flight()));
                ranked.truncate(live - replicas);
                for inst in &ranked {
                    inst.mark_draining();
                }
                ranked
            } else {
                Vec::new()
            };
            (live, victims)
        };

        if live != replicas {
            info!(agent_id = %id, from = live, to = replicas, "scaling deployment");
            global_metrics().increment_counter(
                names::SCALE_EVENTS_TOTAL,
                &[
                    ("agent_type", def.agent_type.as_str()),
                    ("direction", if replicas > live { "up" } else { "down" }),
                ],
            );
            self.events.publish(OrchestratorEvent::Scaled {
                agent_id: id.to_string(),
                from: live,
                to: replicas,
            });
        }

        if live < replicas {
            self.grow(def, pool, replicas - live).await?;
        } else if !victims.is_empty() {
            self.retire(def, pool, victims).await;
        }
        self.deployment_view(pool, id).await
    }

    /// Start `count` replicas and attach the ones that came up.
    async fn grow(&self, def: &Arc<AgentDefinition>, pool: &PoolRef, count: usize) -> Result<StartRound> {
        let (first_index, resources) = {
            let mut guard = pool.write().await;
            let dep = guard
                .deployments
                .get_mut(&def.id)
                .ok_or_else(|| OrchestratorError::DeploymentNotFound(def.id.clone()))?;
            let first = dep.next_replica_index;
            dep.next_replica_index += count;
            (first, dep.resources.clone())
        };

        let round = self.start_replicas(def, first_index, count, &resources).await;

        let mut guard = pool.write().await;
        match guard.deployments.get_mut(&def.id) {
            Some(dep) => {
                dep.instances.extend(round.started.iter().cloned());
                if count > 0 {
                    dep.startup_failures = round.failures.len() as u32;
                }
                if let Some(status) = dep.settle() {
                    self.publish_status(&def.id, status);
                }
            }
            None => {
                drop(guard);
                // Deployment vanished while starting; don't leak the instances.
                self.retire_detached(def, round.started.clone()).await;
            }
        }
        Ok(round)
    }

    async fn start_replicas(
        &self,
        def: &Arc<AgentDefinition>,
        first_index: usize,
        count: usize,
        resources: &ResourceLimits,
    ) -> StartRound {
        let mut round = StartRound::default();
        if count == 0 {
            return round;
        }
        let adapter = match self.adapter_for(def) {
            Ok(adapter) => adapter,
            Err(e) => {
                round.failures = vec![e.to_string(); count];
                return round;
            }
        };

        let starts = (first_index..first_index + count).map(|replica_index| {
            let adapter = adapter.clone();
            let spec = StartSpec {
                definition: def.clone(),
                replica_index,
                resources: resources.clone(),
            };
            async move { adapter.start(&spec).await }
        });

        for outcome in join_all(starts).await {
            match outcome {
                Ok(handle) => {
                    let inst = Arc::new(Instance::new(handle, def.clone(), &self.breaker, self.max_in_flight));
                    info!(agent_id = %def.id, instance_id = %inst.id(), target = %inst.handle().describe(), "instance started");
                    global_metrics().increment_counter(
                        names::INSTANCE_STARTS_TOTAL,
                        &[("agent_type", def.agent_type.as_str()), ("outcome", "ok")],
                    );
                    self.events.publish(OrchestratorEvent::InstanceStarted {
                        agent_id: def.id.clone(),
                        instance_id: inst.id(),
                        runtime: inst.runtime(),
                    });
                    round.started.push(inst);
                }
                Err(e) => {
                    warn!(agent_id = %def.id, error = %e, "instance failed to start");
                    global_metrics().increment_counter(
                        names::INSTANCE_STARTS_TOTAL,
                        &[("agent_type", def.agent_type.as_str()), ("outcome", "error")],
                    );
                    self.events.publish(OrchestratorEvent::InstanceStartFailed {
                        agent_id: def.id.clone(),
                        reason: e.to_string(),
                    });
                    round.failures.push(e.to_string());
                }
            }
        }

        if !round.started.is_empty() {
            global_metrics().add_gauge(
                names::INSTANCES_RUNNING,
                &[("agent_type", def.agent_type.as_str())],
                round.started.len() as i64,
            );
            // New instances become routable after one successful probe.
            self.prober.probe_many(&round.started).await;
        }
        round
    }

    /// Drain and stop `victims` (already marked draining), then detach them.
    async fn retire(&self, def: &Arc<AgentDefinition>, pool: &PoolRef, victims: Vec<Arc<Instance>>) {
        let ids: Vec<InstanceId> = victims.iter().map(|i| i.id()).collect();
        self.retire_detached(def, victims).await;

        let mut guard = pool.write().await;
        if let Some(dep) = guard.deployments.get_mut(&def.id) {
            dep.instances.retain(|i| !ids.contains(&i.id()));
            if let Some(status) = dep.settle() {
                self.publish_status(&def.id, status);
            }
        }
    }

    /// Drain then stop instances that are no longer selectable.
    async fn retire_detached(&self, def: &AgentDefinition, victims: Vec<Arc<Instance>>) {
        if victims.is_empty() {
            return;
        }
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout();
        let grace = self.config.stop_grace();
        let adapter = self.adapters.get(def.runtime);
        let stops = victims.iter().map(|inst| {
            let adapter = adapter.clone();
            async move {
                if !inst.drain(deadline).await {
                    warn!(instance_id = %inst.id(), in_flight = inst.in_flight(), "drain deadline elapsed, stopping anyway");
                }
                if let Some(adapter) = adapter {
                    if let Err(e) = adapter.stop(inst.handle(), grace).await {
                        warn!(instance_id = %inst.id(), error = %e, "instance stop failed");
                    }
                }
                info!(agent_id = %def.id, instance_id = %inst.id(), "instance stopped");
                self.events.publish(OrchestratorEvent::InstanceStopped {
                    agent_id: def.id.clone(),
                    instance_id: inst.id(),
                });
            }
        });
        join_all(stops).await;
        global_metrics().add_gauge(
            names::INSTANCES_RUNNING,
            &[("agent_type", def.agent_type.as_str())],
            -(victims.len() as i64),
        );
    }

    fn publish_status(&self, agent_id: &str, status: DeploymentStatus) {
        info!(agent_id, %status, "deployment status changed");
        self.events.publish(OrchestratorEvent::DeploymentStatusChanged {
            agent_id: agent_id.to_string(),
            status,
        });
    }

    /// Drain and stop every instance, then forget the agent entirely.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        let def = self.require_definition(id)?;
        let lock = self.ops_lock(id);
        {
            let _op = lock.lock().await;
            if let Some(pool) = self.pool(&def.agent_type) {
                let victims: Vec<Arc<Instance>> = {
                    let guard = pool.read().await;
                    guard
                        .deployments
                        .get(id)
                        .map(|dep| dep.instances.clone())
                        .unwrap_or_default()
                };
                for inst in &victims {
                    inst.mark_draining();
                }
                self.retire_detached(&def, victims).await;
                pool.write().await.deployments.remove(id);
            }
            self.definitions.remove(id);
        }
        self.ops.remove(id);

        info!(agent_id = %id, "agent unregistered");
        self.events.publish(OrchestratorEvent::AgentUnregistered {
            agent_id: id.to_string(),
        });
        Ok(())
    }

    // -- Reads ----------------------------------------------------------------

    async fn deployment_view(&self, pool: &PoolRef, id: &str) -> Result<DeploymentView> {
        pool.read()
            .await
            .deployments
            .get(id)
            .map(Deployment::view)
            .ok_or_else(|| OrchestratorError::DeploymentNotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<AgentDetail> {
        let def = self.require_definition(id)?;
        let deployment = match self.pool(&def.agent_type) {
            Some(pool) => pool.read().await.deployments.get(id).map(Deployment::view),
            None => None,
        };
        Ok(AgentDetail {
            definition: def.as_ref().clone(),
            deployment,
        })
    }

    pub async fn list(&self) -> Vec<AgentSummary> {
        let defs: Vec<Arc<AgentDefinition>> =
            self.definitions.iter().map(|d| d.value().clone()).collect();
        let mut out = Vec::with_capacity(defs.len());
        for def in defs {
            let (status, replicas) = match self.pool(&def.agent_type) {
                Some(pool) => match pool.read().await.deployments.get(&def.id) {
                    Some(dep) => (
                        match dep.status {
                            DeploymentStatus::Healthy => AgentStatus::Healthy,
                            DeploymentStatus::Degraded => AgentStatus::Degraded,
                        },
                        dep.live_count(),
                    ),
                    None => (AgentStatus::Registered, 0),
                },
                None => (AgentStatus::Registered, 0),
            };
            out.push(AgentSummary {
                id: def.id.clone(),
                agent_type: def.agent_type.clone(),
                version: def.version.to_string(),
                runtime: def.runtime,
                status,
                replicas,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Aggregate health of one agent's instances.
    pub async fn health(&self, id: &str) -> Result<HealthReport> {
        let def = self.require_definition(id)?;
        let instances = match self.pool(&def.agent_type) {
            Some(pool) => pool
                .read()
                .await
                .deployments
                .get(id)
                .map(|dep| dep.instances.iter().map(|i| i.view()).collect())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let states: Vec<HealthState> = instances.iter().map(|v| v.health).collect();
        Ok(HealthReport {
            agent_id: id.to_string(),
            status: aggregate_health(&states),
            last_check: instances.iter().filter_map(|v| v.last_check).max(),
            instances,
        })
    }

    /// Every instance of `agent_type`, including draining ones; selection
    /// filters further.
    pub async fn snapshot(&self, agent_type: &str) -> Vec<Arc<Instance>> {
        match self.pool(agent_type) {
            Some(pool) => pool
                .read()
                .await
                .deployments
                .values()
                .flat_map(|dep| dep.instances.iter().cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn all_instances(&self) -> Vec<Arc<Instance>> {
        let pools: Vec<PoolRef> = self.pools.iter().map(|p| p.value().clone()).collect();
        let mut out = Vec::new();
        for pool in pools {
            let guard = pool.read().await;
            out.extend(guard.deployments.values().flat_map(|dep| dep.instances.iter().cloned()));
        }
        out
    }

    /// Deployments that carry an auto-scale policy, with their current load.
    pub async fn scale_targets(&self) -> Vec<ScaleTarget> {
        let pools: Vec<(String, PoolRef)> = self
            .pools
            .iter()
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect();
        let mut out = Vec::new();
        for (agent_type, pool) in pools {
            let guard = pool.read().await;
            for dep in guard.deployments.values() {
                let Some(policy) = dep.autoscale.clone() else {
                    continue;
                };
                out.push(ScaleTarget {
                    agent_id: dep.agent_id.clone(),
                    agent_type: agent_type.clone(),
                    replicas: dep.live_count(),
                    in_flight: dep.live().map(|i| i.in_flight()).sum(),
                    capacity_per_instance: self.max_in_flight,
                    policy,
                });
            }
        }
        out
    }

    // -- Reconciliation -------------------------------------------------------

    /// Replace long-Unhealthy instances and start missing replicas.
    pub async fn reconcile(&self) -> ReconcileReport {
        let ids: Vec<String> = self.definitions.iter().map(|d| d.key().clone()).collect();
        let mut report = ReconcileReport::default();
        for id in ids {
            let Some(def) = self.definition(&id) else {
                continue;
            };
            let Some(pool) = self.pool(&def.agent_type) else {
                continue;
            };
            let lock = self.ops_lock(&id);
            let _op = lock.lock().await;

            let now = Instant::now();
            let eviction = self.config.unhealthy_eviction();
            let (evict, missing) = {
                let guard = pool.read().await;
                let Some(dep) = guard.deployments.get(&id) else {
                    continue;
                };
                let evict: Vec<Arc<Instance>> = dep
                    .live()
                    .filter(|i| {
                        i.health_cell()
                            .unhealthy_for(now)
                            .is_some_and(|d| d >= eviction)
                    })
                    .cloned()
                    .collect();
                for inst in &evict {
                    inst.mark_draining();
                }
                let live_after = dep.live_count();
                (evict, dep.desired_replicas.saturating_sub(live_after))
            };

            if !evict.is_empty() {
                warn!(agent_id = %id, count = evict.len(), "evicting unhealthy instances");
                report.evicted += evict.len();
                self.retire(&def, &pool, evict).await;
            }
            if missing > 0 {
                debug!(agent_id = %id, missing, "starting missing replicas");
                if let Ok(round) = self.grow(&def, &pool, missing).await {
                    report.started += round.started.len();
                    report.failed += round.failures.len();
                }
            }
        }
        if report != ReconcileReport::default() {
            info!(evicted = report.evicted, started = report.started, failed = report.failed, "reconcile pass complete");
        }
        report
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("definitions", &self.definitions.len())
            .field("pools", &self.pools.len())
            .finish()
    }
}

/// Lower ranks are retired first on scale-down.
fn retire_rank(state: HealthState) -> u8 {
    match state {
        HealthState::Unhealthy => 0,
        HealthState::Unknown => 1,
        HealthState::Degraded => 2,
        HealthState::Healthy => 3,
    }
}

fn aggregate_health(states: &[HealthState]) -> HealthState {
    if states.is_empty() {
        HealthState::Unknown
    } else if states.iter().all(|s| *s == HealthState::Healthy) {
        HealthState::Healthy
    } else if states.iter().any(|s| s.is_routable()) {
        HealthState::Degraded
    } else if states.contains(&HealthState::Unhealthy) {
        HealthState::Unhealthy
    } else {
        HealthState::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_core::types::RuntimeKind;
    use ao_runtime::HandlerRegistry;
    use semver::Version;
    use serde_json::json;

    fn registry() -> Registry {
        let config = Config::default();
        let adapters = AdapterSet::standard(&config.runtime, Arc::new(HandlerRegistry::with_builtins()));
        Registry::new(&config, adapters, EventBus::new())
    }

    fn echo(id: &str) -> AgentDefinition {
        AgentDefinition::new(id, "echo", Version::new(1, 0, 0), RuntimeKind::InProcess)
    }

    #[test]
    fn aggregate_health_prefers_worst_case_visibility() {
        use HealthState::*;
        assert_eq!(aggregate_health(&[]), Unknown);
        assert_eq!(aggregate_health(&[Healthy, Healthy]), Healthy);
        assert_eq!(aggregate_health(&[Healthy, Unhealthy]), Degraded);
        assert_eq!(aggregate_health(&[Unhealthy, Unknown]), Unhealthy);
        assert_eq!(aggregate_health(&[Unknown]), Unknown);
    }

    #[test]
    fn scale_down_retires_unhealthiest_first() {
        let mut states = vec![HealthState::Healthy, HealthState::Unhealthy, HealthState::Degraded];
        states.sort_by_key(|s| retire_rank(*s));
        assert_eq!(states[0], HealthState::Unhealthy);
    }

    #[test]
    fn register_rejects_empty_fields_and_unknown_handlers() {
        let reg = registry();
        let err = reg.register(echo("")).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidDefinition(_)));

        let bad = AgentDefinition::new("x", "no-such-handler", Version::new(1, 0, 0), RuntimeKind::InProcess);
        let err = reg.register(bad).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidDefinition(_)));

        let http = AgentDefinition::new("h", "remote", Version::new(1, 0, 0), RuntimeKind::Http)
            .with_config(json!({ "endpoint": "ftp://nope" }));
        assert!(reg.register(http).is_err());
    }

    #[tokio::test]
    async fn deploy_starts_replicas_and_probes_them() {
        let reg = registry();
        reg.register(echo("echo-1")).unwrap();
        let view = reg.deploy("echo-1", DeploySpec::replicas(3)).await.unwrap();
        assert_eq!(view.instances.len(), 3);
        assert_eq!(view.status, DeploymentStatus::Healthy);
        assert!(view.instances.iter().all(|i| i.health == HealthState::Healthy));

        let summary = reg.list().await;
        assert_eq!(summary[0].replicas, 3);
        assert_eq!(summary[0].status, AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn deploy_unknown_agent_is_not_found() {
        let reg = registry();
        let err = reg.deploy("ghost", DeploySpec::replicas(1)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn scale_without_deployment_fails() {
        let reg = registry();
        reg.register(echo("echo-1")).unwrap();
        let err = reg.scale("echo-1", 2).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DeploymentNotFound(_)));
    }

    #[tokio::test]
    async fn unregister_removes_everything() {
        let reg = registry();
        reg.register(echo("echo-1")).unwrap();
        reg.deploy("echo-1", DeploySpec::replicas(2)).await.unwrap();
        reg.unregister("echo-1").await.unwrap();
        assert!(reg.snapshot("echo").await.is_empty());
        assert!(reg.list().await.is_empty());
        assert!(matches!(
            reg.health("echo-1").await.unwrap_err(),
            OrchestratorError::AgentNotFound(_)
        ));
        // The id is free again.
        reg.register(echo("echo-1")).unwrap();
    }
}
