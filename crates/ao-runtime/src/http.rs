use std::time::Duration;

use ao_core::types::{AgentDefinition, RuntimeKind, Task, TaskOutput};
use async_trait::async_trait;
use tracing::debug;

use crate::adapter::{
    config_string_list, HandleTarget, InstanceHandle, Result, RuntimeAdapter, RuntimeError,
    StartSpec,
};
use crate::wire::HttpTransport;

/// Agents already running elsewhere, reached over the wire protocol.
///
/// `config.endpoints` lists base URLs; replica `i` binds to
/// `endpoints[i % len]`. A single `config.endpoint` string is also accepted.
pub struct HttpAdapter {
    transport: HttpTransport,
}

impl HttpAdapter {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }

    fn endpoints(def: &AgentDefinition) -> Result<Vec<String>> {
        let mut endpoints = config_string_list(def, "endpoints")?;
        if let Some(single) = def.config_str("endpoint") {
            endpoints.push(single.to_owned());
        }
        if endpoints.is_empty() {
            return Err(RuntimeError::InvalidDefinition(
                "http agents need config.endpoints or config.endpoint".into(),
            ));
        }
        for url in &endpoints {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(RuntimeError::InvalidDefinition(format!(
                    "endpoint `{url}` is not an http(s) URL"
                )));
            }
        }
        Ok(endpoints)
    }
}

pub(crate) fn require_url(instance: &InstanceHandle) -> Result<&str> {
    instance
        .url()
        .ok_or_else(|| RuntimeError::Execution(format!("instance {} has no endpoint", instance.id)))
}

#[async_trait]
impl RuntimeAdapter for HttpAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Http
    }

    fn validate(&self, definition: &AgentDefinition) -> Result<()> {
        Self::endpoints(definition).map(|_| ())
    }

    async fn start(&self, spec: &StartSpec) -> Result<InstanceHandle> {
        let endpoints = Self::endpoints(&spec.definition).map_err(|e| RuntimeError::Startup(e.to_string()))?;
        let url = endpoints[spec.replica_index % endpoints.len()].clone();
        let handle = InstanceHandle::new(RuntimeKind::Http, HandleTarget::Endpoint { url });
        debug!(instance_id = %handle.id, target = %handle.describe(), "http instance bound");
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

    async fn stop(&self, instance: &InstanceHandle, _grace: Duration) -> Result<()> {
        // Remote endpoints are not owned; unbinding is enough.
        debug!(instance_id = %instance.id, "http instance released");
        Ok(())
    }

    async fn health_check(&self, instance: &InstanceHandle, timeout: Duration) -> Result<()> {
        self.transport.health(require_url(instance)?, timeout).await
    }
}
