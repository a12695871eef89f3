use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use ao_core::types::{AgentDefinition, ResourceLimits, RuntimeKind, Task, TaskOutput};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::adapter::{HandleTarget, InstanceHandle, Result, RuntimeAdapter, RuntimeError, StartSpec};
use crate::http::require_url;
use crate::wire::HttpTransport;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Shape of `config` for container agents.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerAgentConfig {
    pub image: String,
    /// Port the agent listens on inside the container.
    #[serde(default = "default_container_port")]
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra arguments passed after the image name.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
}

fn default_container_port() -> u16 {
    8080
}

impl ContainerAgentConfig {
    pub fn from_definition(def: &AgentDefinition) -> Result<Self> {
        let cfg: Self = serde_json::from_value(def.config.clone())
            .map_err(|e| RuntimeError::InvalidDefinition(format!("container config: {e}")))?;
        if cfg.image.trim().is_empty() {
            return Err(RuntimeError::InvalidDefinition(
                "container config: image must not be empty".into(),
            ));
        }
        Ok(cfg)
    }

    /// Arguments for `docker run`.
    pub fn run_args(&self, agent_id: &str, limits: &ResourceLimits) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--publish".to_string(),
            format!("127.0.0.1::{}", self.port),
            "--label".to_string(),
            format!("agent-orchestrator.agent={agent_id}"),
            "--env".to_string(),
            format!("AGENT_PORT={}", self.port),
        ];
        if let Some(mb) = limits.memory_mb {
            args.push("--memory".into());
            args.push(format!("{mb}m"));
        }
        if let Some(cpus) = limits.cpus {
            args.push("--cpus".into());
            args.push(format!("{cpus}"));
        }
        if let Some(network) = &self.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        for (key, value) in &self.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Turn `docker port` output such as `127.0.0.1:49153` into a base URL.
pub fn parse_published_port(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (host, port) = line.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = match host {
        "0.0.0.0" | "" | "[::]" | "::" => "127.0.0.1",
        other => other,
    };
    Some(format!("http://{host}:{port}"))
}

// ---------------------------------------------------------------------------
// ContainerAdapter
// ---------------------------------------------------------------------------

/// Runs each replica as a container through the `docker` CLI.
pub struct ContainerAdapter {
    docker_bin: String,
    transport: HttpTransport,
    startup_timeout: Duration,
}

impl ContainerAdapter {
    pub fn new(docker_bin: String, transport: HttpTransport, startup_timeout: Duration) -> Self {
        Self {
            docker_bin,
            transport,
            startup_timeout,
        }
    }

    async fn docker(&self, args: &[String]) -> std::result::Result<String, String> {
        debug!(bin = %self.docker_bin, ?args, "invoking docker");
        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.docker_bin))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(format!(
                "docker {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    async fn remove(&self, container_id: &str) {
        let args = vec!["rm".to_string(), "--force".to_string(), container_id.to_string()];
        if let Err(e) = self.docker(&args).await {
            warn!(container_id, error = %e, "container removal failed");
        }
    }
}

#[async_trait]
impl RuntimeAdapter for ContainerAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Container
    }

    fn validate(&self, definition: &AgentDefinition) -> Result<()> {
        ContainerAgentConfig::from_definition(definition).map(|_| ())
    }

    async fn start(&self, spec: &StartSpec) -> Result<InstanceHandle> {
        let cfg = ContainerAgentConfig::from_definition(&spec.definition)
            .map_err(|e| RuntimeError::Startup(e.to_string()))?;
        let container_id = self
            .docker(&cfg.run_args(&spec.definition.id, &spec.resources))
            .await
            .map_err(RuntimeError::Startup)?;

        let port_args = vec![
            "port".to_string(),
            container_id.clone(),
            format!("{}/tcp", cfg.port),
        ];
        let url = match self.docker(&port_args).await {
            Ok(out) => match parse_published_port(&out) {
                Some(url) => url,
                None => {
                    self.remove(&container_id).await;
                    return Err(RuntimeError::Startup(format!(
                        "unexpected `docker port` output: {out}"
                    )));
                }
            },
            Err(e) => {
                self.remove(&container_id).await;
                return Err(RuntimeError::Startup(e));
            }
        };

        if let Err(e) = self.transport.wait_ready(&url, self.startup_timeout).await {
            self.remove(&container_id).await;
            return Err(e);
        }

        let handle = InstanceHandle::new(
            RuntimeKind::Container,
            HandleTarget::Container { container_id, url },
        );
        info!(instance_id = %handle.id, target = %handle.describe(), "container started");
        Ok(handle)
    }

    async fn execute(
        &self,
        instance: &InstanceHandle,
        task: &Task,
        deadline: Duration,
    ) -> Result<TaskOutput> {
        self.transport.execute(require_url(instance)?, task, deadline).await
    }

    async fn stop(&self, instance: &InstanceHandle, grace: Duration) -> Result<()> {
        let HandleTarget::Container { container_id, .. } = &instance.target else {
            return Err(RuntimeError::Execution(format!(
                "container adapter given foreign handle {:?}",
                instance.target
            )));
        };

        let stop_args = vec![
            "stop".to_string(),
            "--time".to_string(),
            grace.as_secs().max(1).to_string(),
            container_id.clone(),
        ];
        // docker itself escalates to SIGKILL after --time; the outer bound
        // only guards against a wedged daemon.
        let outer = grace + Duration::from_secs(5);
        match tokio::time::timeout(outer, self.docker(&stop_args)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(container_id = %container_id, error = %e, "docker stop failed"),
            Err(_) => warn!(container_id = %container_id, "docker stop hung, forcing removal"),
        }
        self.remove(container_id).await;
        info!(instance_id = %instance.id, "container stopped");
        Ok(())
    }

    async fn health_check(&self, instance: &InstanceHandle, timeout: Duration) -> Result<()> {
        self.transport.health(require_url(instance)?, timeout).await
    }
}
