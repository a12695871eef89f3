use std::sync::Arc;

use ao_core::config::Config;
use ao_core::types::{
    AgentDefinition, AgentSummary, DeploymentView, HealthReport, Task, TaskResult,
};
use ao_core::Result;
use ao_harness::shutdown::ShutdownSignal;
use ao_runtime::{AdapterSet, HandlerRegistry};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::autoscaler::{AutoScaler, ScaleDecision};
use crate::events::{Envelope, EventBus};
use crate::health::HealthMonitor;
use crate::registry::{AgentDetail, DeploySpec, ReconcileReport, Registry};
use crate::router::TaskRouter;

/// The orchestration API: registry, router and background loops behind one
/// handle.
pub struct Orchestrator {
    config: Config,
    events: EventBus,
    registry: Arc<Registry>,
    router: TaskRouter,
    autoscaler: Arc<AutoScaler>,
    monitor: HealthMonitor,
}

impl Orchestrator {
    pub fn new(config: Config, adapters: AdapterSet) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(Registry::new(&config, adapters, events.clone()));
        let router = TaskRouter::new(registry.clone(), config.router.clone(), events.clone());
        let autoscaler = Arc::new(AutoScaler::new(registry.clone(), config.autoscaler.clone()));
        let monitor = HealthMonitor::new(registry.clone());
        Self {
            config,
            events,
            registry,
            router,
            autoscaler,
            monitor,
        }
    }

    /// All four built-in runtime adapters, with `handlers` backing the
    /// in-process one.
    pub fn with_standard_adapters(config: Config, handlers: Arc<HandlerRegistry>) -> Self {
        let adapters = AdapterSet::standard(&config.runtime, handlers);
        Self::new(config, adapters)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> flume::Receiver<Envelope> {
        self.events.subscribe()
    }

    // -- Orchestration API ----------------------------------------------------

    pub fn register(&self, definition: AgentDefinition) -> Result<String> {
        self.registry.register(definition)
    }

    pub async fn deploy(&self, id: &str, spec: DeploySpec) -> Result<DeploymentView> {
        self.registry.deploy(id, spec).await
    }

    pub async fn scale(&self, id: &str, replicas: usize) -> Result<DeploymentView> {
        self.registry.scale(id, replicas).await
    }

    pub async fn health(&self, id: &str) -> Result<HealthReport> {
        self.registry.health(id).await
    }

    pub async fn list(&self) -> Vec<AgentSummary> {
        self.registry.list().await
    }

    pub async fn get(&self, id: &str) -> Result<AgentDetail> {
        self.registry.get(id).await
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        self.registry.unregister(id).await
    }

    pub async fn execute_task(&self, agent_type: &str, task: Task) -> Result<TaskResult> {
        self.router.execute(agent_type, task).await
    }

    // -- Maintenance ----------------------------------------------------------

    pub async fn reconcile(&self) -> ReconcileReport {
        self.registry.reconcile().await
    }

    pub async fn run_health_checks(&self) -> usize {
        self.monitor.run_once().await
    }

    pub async fn autoscale(&self) -> Vec<ScaleDecision> {
        self.autoscaler.evaluate().await
    }

    /// Start the health, reconcile and (if enabled) autoscale loops.
    pub fn spawn_background(&self, signal: &ShutdownSignal) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.monitor.clone().spawn(signal)];

        let registry = self.registry.clone();
        handles.push(ao_harness::periodic::spawn_periodic(
            "reconciler",
            self.registry.config().reconcile_interval(),
            signal,
            move || {
                let registry = registry.clone();
                async move {
                    registry.reconcile().await;
                }
            },
        ));

        if self.config.autoscaler.enabled {
            handles.push(self.autoscaler.clone().spawn(&self.events, signal));
        }
        info!(loops = handles.len(), "background loops spawned");
        handles
    }

    /// Drain and stop every deployment.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.list().await.into_iter().map(|s| s.id).collect();
        for id in ids {
            if let Err(e) = self.registry.unregister(&id).await {
                warn!(agent_id = %id, error = %e, "failed to stop agent during shutdown");
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("events", &self.events)
            .finish()
    }
}
