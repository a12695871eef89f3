use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ao_core::config::RuntimeConfig;
use ao_core::types::{AgentDefinition, InstanceId, ResourceLimits, RuntimeKind, Task, TaskOutput};
use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::container::ContainerAdapter;
use crate::http::HttpAdapter;
use crate::in_process::{AgentHandler, HandlerRegistry, InProcessAdapter};
use crate::process::ProcessAdapter;
use crate::wire::HttpTransport;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Backend failures, translated from whatever the backend reports.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// ---------------------------------------------------------------------------
// StartSpec / InstanceHandle
// ---------------------------------------------------------------------------

/// Everything an adapter needs to bring up one replica.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub definition: Arc<AgentDefinition>,
    /// Position of this replica in the deployment, used for endpoint selection.
    pub replica_index: usize,
    pub resources: ResourceLimits,
}

/// Backend-specific reference to a running instance.
#[derive(Clone)]
pub enum HandleTarget {
    InProcess {
        handler: Arc<dyn AgentHandler>,
    },
    Endpoint {
        url: String,
    },
    Container {
        container_id: String,
        url: String,
    },
    Process {
        pid: Option<u32>,
        url: String,
        child: Arc<Mutex<Option<Child>>>,
    },
}

impl fmt::Debug for HandleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleTarget::InProcess { .. } => f.write_str("InProcess"),
            HandleTarget::Endpoint { url } => f.debug_struct("Endpoint").field("url", url).finish(),
            HandleTarget::Container { container_id, url } => f
                .debug_struct("Container")
                .field("container_id", container_id)
                .field("url", url)
                .finish(),
            HandleTarget::Process { pid, url, .. } => f
                .debug_struct("Process")
                .field("pid", pid)
                .field("url", url)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceHandle {
    pub id: InstanceId,
    pub kind: RuntimeKind,
    pub target: HandleTarget,
}

impl InstanceHandle {
    pub fn new(kind: RuntimeKind, target: HandleTarget) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target,
        }
    }

    /// Base URL for backends that speak the wire protocol.
    pub fn url(&self) -> Option<&str> {
        match &self.target {
            HandleTarget::InProcess { .. } => None,
            HandleTarget::Endpoint { url }
            | HandleTarget::Container { url, .. }
            | HandleTarget::Process { url, .. } => Some(url),
        }
    }

    /// Short human-readable location for status views.
    pub fn describe(&self) -> String {
        match &self.target {
            HandleTarget::InProcess { .. } => format!("in-process:{}", self.id),
            HandleTarget::Endpoint { url } => url.clone(),
            HandleTarget::Container { container_id, url } => {
                let short = container_id.get(..12).unwrap_or(container_id);
                format!("container:{short}@{url}")
            }
            HandleTarget::Process { pid, url, .. } => match pid {
                Some(pid) => format!("pid:{pid}@{url}"),
                None => format!("pid:?@{url}"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeAdapter trait
// ---------------------------------------------------------------------------

/// Uniform lifecycle contract every execution backend implements.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Check the opaque `config` of a definition before it is registered.
    fn validate(&self, definition: &AgentDefinition) -> Result<()>;

    async fn start(&self, spec: &StartSpec) -> Result<InstanceHandle>;

    /// Run one task, giving up after `deadline`.
    async fn execute(
        &self,
        instance: &InstanceHandle,
        task: &Task,
        deadline: Duration,
    ) -> Result<TaskOutput>;

    /// Stop gracefully within `grace`, then force-terminate.
    async fn stop(&self, instance: &InstanceHandle, grace: Duration) -> Result<()>;

    async fn health_check(&self, instance: &InstanceHandle, timeout: Duration) -> Result<()>;
}

// ---------------------------------------------------------------------------
// AdapterSet
// ---------------------------------------------------------------------------

/// Adapters keyed by runtime kind.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<RuntimeKind, Arc<dyn RuntimeAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// All four built-in backends sharing one HTTP transport.
    pub fn standard(config: &RuntimeConfig, handlers: Arc<HandlerRegistry>) -> Self {
        let transport = HttpTransport::new(config);
        let startup_timeout = Duration::from_millis(config.startup_timeout_ms);
        Self::new()
            .with_adapter(Arc::new(InProcessAdapter::new(handlers)))
            .with_adapter(Arc::new(HttpAdapter::new(transport.clone())))
            .with_adapter(Arc::new(ContainerAdapter::new(
                config.docker_bin.clone(),
                transport.clone(),
                startup_timeout,
            )))
            .with_adapter(Arc::new(ProcessAdapter::new(transport, startup_timeout)))
    }

    /// Register or replace the adapter for its kind.
    pub fn with_adapter(mut self, adapter: Arc<dyn RuntimeAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: RuntimeKind) -> Option<Arc<dyn RuntimeAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<RuntimeKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSet")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Config helpers shared by adapters
// ---------------------------------------------------------------------------

pub(crate) fn config_string_list(def: &AgentDefinition, key: &str) -> Result<Vec<String>> {
    match def.config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_owned).ok_or_else(|| {
                    RuntimeError::InvalidDefinition(format!("config.{key} must contain only strings"))
                })
            })
            .collect(),
        Some(_) => Err(RuntimeError::InvalidDefinition(format!(
            "config.{key} must be an array of strings"
        ))),
    }
}

pub(crate) fn config_env(def: &AgentDefinition) -> Result<Vec<(String, String)>> {
    match def.config.get("env") {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => Ok((k.clone(), s.clone())),
                other => Ok((k.clone(), other.to_string())),
            })
            .collect(),
        Some(_) => Err(RuntimeError::InvalidDefinition(
            "config.env must be an object".into(),
        )),
    }
}
