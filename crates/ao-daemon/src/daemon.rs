use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ao_core::config::Config;
use ao_harness::shutdown::ShutdownSignal;
use ao_orchestrator::{DeploySpec, Orchestrator};
use ao_runtime::HandlerRegistry;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::http_api::api_router;

/// Hosts the orchestrator: bootstraps configured agents, runs the health,
/// reconcile and autoscale loops, and serves the HTTP API until shutdown.
pub struct Daemon {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// A daemon whose in-process runtime knows the built-in handlers.
    pub fn new(config: Config) -> Self {
        Self::with_handlers(config, Arc::new(HandlerRegistry::with_builtins()))
    }

    pub fn with_handlers(config: Config, handlers: Arc<HandlerRegistry>) -> Self {
        let orchestrator = Arc::new(Orchestrator::with_standard_adapters(config.clone(), handlers));
        Self {
            config,
            orchestrator,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Clone of the shutdown signal, for the ctrl-c handler.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Register and deploy every `[[agents]]` entry. Failures are logged and
    /// skipped; returns how many agents were deployed.
    pub async fn bootstrap(&self) -> usize {
        let mut deployed = 0;
        for entry in &self.config.agents {
            let id = entry.definition.id.clone();
            if let Err(e) = self.orchestrator.register(entry.definition.clone()) {
                warn!(agent_id = %id, error = %e, "bootstrap registration failed");
                continue;
            }
            let mut spec = DeploySpec::replicas(entry.replicas).with_resources(entry.resources.clone());
            if let Some(policy) = &entry.autoscale {
                spec = spec.with_autoscale(policy.clone());
            }
            match self.orchestrator.deploy(&id, spec).await {
                Ok(view) => {
                    info!(
                        agent_id = %id,
                        replicas = view.instances.len(),
                        status = %view.status,
                        "bootstrap deployment started"
                    );
                    deployed += 1;
                }
                Err(e) => warn!(agent_id = %id, error = %e, "bootstrap deployment failed"),
            }
        }
        deployed
    }

    /// Bind `daemon.host:daemon.port` and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API listener on {addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Run on an already-bound listener. Returns after the API stopped, every
    /// deployment was drained and the background loops confirmed exit.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("listener has no local address")?;
        let bootstrapped = self.bootstrap().await;
        let loops = self.orchestrator.spawn_background(&self.shutdown);
        info!(addr = %local, agents = bootstrapped, loops = loops.len(), "agent orchestrator daemon started");

        let mut api_stop = self.shutdown.listener();
        axum::serve(listener, api_router(self.orchestrator.clone()))
            .with_graceful_shutdown(async move { api_stop.cancelled().await })
            .await
            .context("API server failed")?;
        info!("API server stopped, draining deployments");

        self.orchestrator.shutdown().await;

        let drain = Duration::from_millis(self.config.daemon.shutdown_drain_ms);
        let mut signal = self.shutdown.clone();
        if !signal.wait_for_drain(loops.len(), drain).await.is_complete() {
            for handle in &loops {
                handle.abort();
            }
        }
        info!("agent orchestrator daemon stopped");
        Ok(())
    }
}
