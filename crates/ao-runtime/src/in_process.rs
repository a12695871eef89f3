use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ao_core::types::{AgentDefinition, RuntimeKind, Task, TaskOutput};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, warn};

use crate::adapter::{HandleTarget, InstanceHandle, Result, RuntimeAdapter, RuntimeError, StartSpec};

// ---------------------------------------------------------------------------
// AgentHandler
// ---------------------------------------------------------------------------

/// An agent that runs inside the orchestrator's own process.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// `Err` is an infrastructure failure; a handled rejection is
    /// `Ok(TaskOutput { success: false, .. })`.
    async fn handle(&self, task: &Task) -> std::result::Result<TaskOutput, String>;

    async fn health(&self) -> bool {
        true
    }
}

pub type HandlerFactory =
    Arc<dyn Fn(&AgentDefinition) -> std::result::Result<Arc<dyn AgentHandler>, String> + Send + Sync>;

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Named factories that build one handler per started instance.
///
/// A definition selects its factory with `config.handler`, falling back to
/// its agent type.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: RwLock<HashMap<String, HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `echo` handler.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("echo", |def: &AgentDefinition| {
            Ok(Arc::new(EchoAgent::from_definition(def)) as Arc<dyn AgentHandler>)
        });
        registry
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AgentDefinition) -> std::result::Result<Arc<dyn AgentHandler>, String>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
    }

    fn factory(&self, name: &str) -> Option<HandlerFactory> {
        self.factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }
}

/// Text of a caught handler panic.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

fn handler_name(def: &AgentDefinition) -> &str {
    def.config_str("handler").unwrap_or(&def.agent_type)
}

// ---------------------------------------------------------------------------
// EchoAgent
// ---------------------------------------------------------------------------

/// Returns its input. `config.delay_ms` adds artificial latency and
/// `config.fail_types` lists task types it rejects.
#[derive(Debug, Default, Clone)]
pub struct EchoAgent {
    delay: Option<Duration>,
    fail_types: Vec<String>,
}

impl EchoAgent {
    pub fn from_definition(def: &AgentDefinition) -> Self {
        let fail_types = def
            .config
            .get("fail_types")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            delay: def.config_u64("delay_ms").map(Duration::from_millis),
            fail_types,
        }
    }
}

#[async_trait]
impl AgentHandler for EchoAgent {
    async fn handle(&self, task: &Task) -> std::result::Result<TaskOutput, String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_types.iter().any(|t| t == &task.task_type) {
            return Ok(TaskOutput::rejected(
                format!("echo refuses task type `{}`", task.task_type),
                serde_json::Value::Null,
            ));
        }
        let data = if task.task_type == "ping" {
            json!({ "pong": true, "task_id": task.id })
        } else {
            json!({ "echo": task.payload, "task_id": task.id })
        };
        Ok(TaskOutput::ok(data))
    }
}

// ---------------------------------------------------------------------------
// InProcessAdapter
// ---------------------------------------------------------------------------

pub struct InProcessAdapter {
    handlers: Arc<HandlerRegistry>,
}

impl InProcessAdapter {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }

    fn handler_of(instance: &InstanceHandle) -> Result<&Arc<dyn AgentHandler>> {
        match &instance.target {
            HandleTarget::InProcess { handler } => Ok(handler),
            other => Err(RuntimeError::Execution(format!(
                "in-process adapter given foreign handle {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for InProcessAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::InProcess
    }

    fn validate(&self, definition: &AgentDefinition) -> Result<()> {
        let name = handler_name(definition);
        if self.handlers.contains(name) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidDefinition(format!(
                "no in-process handler named `{name}`"
            )))
        }
    }

    async fn start(&self, spec: &StartSpec) -> Result<InstanceHandle> {
        let name = handler_name(&spec.definition);
        let factory = self
            .handlers
            .factory(name)
            .ok_or_else(|| RuntimeError::Startup(format!("handler `{name}` disappeared")))?;
        let handler = factory(spec.definition.as_ref()).map_err(RuntimeError::Startup)?;
        let handle = InstanceHandle::new(RuntimeKind::InProcess, HandleTarget::InProcess { handler });
        debug!(instance_id = %handle.id, handler = name, "in-process instance started");
        Ok(handle)
    }

    async fn execute(
        &self,
        instance: &InstanceHandle,
        task: &Task,
        deadline: Duration,
    ) -> Result<TaskOutput> {
        let handler = Self::handler_of(instance)?;
        let call = AssertUnwindSafe(handler.handle(task)).catch_unwind();
        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(reason))) => Err(RuntimeError::Execution(reason)),
            Ok(Err(payload)) => {
                let msg = panic_message(payload);
                warn!(instance_id = %instance.id, panic = %msg, "in-process handler panicked");
                Err(RuntimeError::Execution(format!("handler panicked: {msg}")))
            }
            Err(_) => Err(RuntimeError::Timeout(deadline)),
        }
    }

    async fn stop(&self, instance: &InstanceHandle, _grace: Duration) -> Result<()> {
        // Dropping the last handle reference releases the handler.
        debug!(instance_id = %instance.id, "in-process instance stopped");
        Ok(())
    }

    async fn health_check(&self, instance: &InstanceHandle, timeout: Duration) -> Result<()> {
        let handler = Self::handler_of(instance)?;
        let probe = AssertUnwindSafe(handler.health()).catch_unwind();
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(RuntimeError::Execution("handler reported unhealthy".into())),
            Ok(Err(payload)) => Err(RuntimeError::Execution(format!(
                "health check panicked: {}",
                panic_message(payload)
            ))),
            Err(_) => Err(RuntimeError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_core::types::ResourceLimits;
    use semver::Version;

    fn echo_def(config: serde_json::Value) -> AgentDefinition {
        AgentDefinition::new("echo-1", "echo", Version::new(1, 0, 0), RuntimeKind::InProcess)
            .with_config(config)
    }

    fn spec(def: AgentDefinition) -> StartSpec {
        StartSpec {
            definition: Arc::new(def),
            replica_index: 0,
            resources: ResourceLimits::default(),
        }
    }

    #[test]
    fn validate_requires_known_handler() {
        let adapter = InProcessAdapter::new(Arc::new(HandlerRegistry::with_builtins()));
        assert!(adapter.validate(&echo_def(serde_json::Value::Null)).is_ok());
        let unknown = echo_def(json!({ "handler": "tutor" }));
        assert!(matches!(
            adapter.validate(&unknown),
            Err(RuntimeError::InvalidDefinition(_))
        ));
    }

    #[tokio::test]
    async fn echo_answers_ping() {
        let adapter = InProcessAdapter::new(Arc::new(HandlerRegistry::with_builtins()));
        let handle = adapter.start(&spec(echo_def(serde_json::Value::Null))).await.unwrap();
        let task = Task::new("ping", serde_json::Value::Null);
        let out = adapter
            .execute(&handle, &task, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.data["pong"], true);
        adapter.health_check(&handle, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let adapter = InProcessAdapter::new(Arc::new(HandlerRegistry::with_builtins()));
        let handle = adapter
            .start(&spec(echo_def(json!({ "delay_ms": 200 }))))
            .await
            .unwrap();
        let task = Task::new("ping", serde_json::Value::Null);
        let err = adapter
            .execute(&handle, &task, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout(_)));
    }

    #[tokio::test]
    async fn rejected_type_is_not_an_error() {
        let adapter = InProcessAdapter::new(Arc::new(HandlerRegistry::with_builtins()));
        let handle = adapter
            .start(&spec(echo_def(json!({ "fail_types": ["grade"] }))))
            .await
            .unwrap();
        let out = adapter
            .execute(&handle, &Task::new("grade", json!({})), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.error.unwrap().contains("grade"));
    }

    #[tokio::test]
    async fn custom_factory_is_used() {
        struct Failing;

        #[async_trait]
        impl AgentHandler for Failing {
            async fn handle(&self, _task: &Task) -> std::result::Result<TaskOutput, String> {
                Err("boom".into())
            }
            async fn health(&self) -> bool {
                false
            }
        }

        let registry = HandlerRegistry::new();
        registry.register("failing", |_def: &AgentDefinition| {
            Ok(Arc::new(Failing) as Arc<dyn AgentHandler>)
        });
        let adapter = InProcessAdapter::new(Arc::new(registry));
        let def = AgentDefinition::new("f", "failing", Version::new(0, 1, 0), RuntimeKind::InProcess);
        let handle = adapter.start(&spec(def)).await.unwrap();

        let err = adapter
            .execute(&handle, &Task::new("x", json!(null)), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeError::Execution("boom".into()));
        assert!(adapter
            .health_check(&handle, Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn panicking_handler_becomes_execution_error() {
        struct Exploding;

        #[async_trait]
        impl AgentHandler for Exploding {
            async fn handle(&self, task: &Task) -> std::result::Result<TaskOutput, String> {
                panic!("cannot handle {}", task.task_type);
            }
            async fn health(&self) -> bool {
                panic!("health exploded");
            }
        }

        let registry = HandlerRegistry::new();
        registry.register("exploding", |_def: &AgentDefinition| {
            Ok(Arc::new(Exploding) as Arc<dyn AgentHandler>)
        });
        let adapter = InProcessAdapter::new(Arc::new(registry));
        let def = AgentDefinition::new("x", "exploding", Version::new(0, 1, 0), RuntimeKind::InProcess);
        let handle = adapter.start(&spec(def)).await.unwrap();

        let err = adapter
            .execute(&handle, &Task::new("grade", json!(null)), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Execution("handler panicked: cannot handle grade".into())
        );

        let err = adapter
            .health_check(&handle, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Execution(ref m) if m.contains("health exploded")));
    }
}
