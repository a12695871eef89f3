use std::net::TcpListener;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use ao_core::types::{AgentDefinition, RuntimeKind, Task, TaskOutput};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapter::{
    config_env, config_string_list, HandleTarget, InstanceHandle, Result, RuntimeAdapter,
    RuntimeError, StartSpec,
};
use crate::http::require_url;
use crate::wire::HttpTransport;

const PORT_PLACEHOLDER: &str = "{port}";

/// Reserve a free loopback port by binding to port 0.
fn allocate_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn substitute_port(args: &[String], port: u16) -> Vec<String> {
    let port = port.to_string();
    args.iter()
        .map(|a| a.replace(PORT_PLACEHOLDER, &port))
        .collect()
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    // SAFETY: kill(2) with a pid we spawned and SIGTERM has no memory effects.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}

/// Spawns each replica as a local subprocess.
///
/// `config.command` names the executable, `config.args` its arguments (with
/// `{port}` replaced by the allocated port) and `config.env` extra
/// environment. The child also receives `AGENT_PORT`.
pub struct ProcessAdapter {
    transport: HttpTransport,
    startup_timeout: Duration,
}

impl ProcessAdapter {
    pub fn new(transport: HttpTransport, startup_timeout: Duration) -> Self {
        Self {
            transport,
            startup_timeout,
        }
    }

    fn command_of(def: &AgentDefinition) -> Result<String> {
        match def.config_str("command").map(str::trim) {
            Some(cmd) if !cmd.is_empty() => Ok(cmd.to_owned()),
            _ => Err(RuntimeError::InvalidDefinition(
                "process agents need a non-empty config.command".into(),
            )),
        }
    }

    fn child_of(instance: &InstanceHandle) -> Result<(Option<u32>, &Arc<Mutex<Option<Child>>>)> {
        match &instance.target {
            HandleTarget::Process { pid, child, .. } => Ok((*pid, child)),
            other => Err(RuntimeError::Execution(format!(
                "process adapter given foreign handle {other:?}"
            ))),
        }
    }

    /// Wait for readiness while watching for the child exiting early.
    async fn await_ready(&self, url: &str, child: &mut Child) -> Result<()> {
        tokio::select! {
            ready = self.transport.wait_ready(url, self.startup_timeout) => ready,
            status = child.wait() => Err(RuntimeError::Startup(match status {
                Ok(status) => format!("process exited during startup with {status}"),
                Err(e) => format!("process wait failed: {e}"),
            })),
        }
    }
}

#[async_trait]
impl RuntimeAdapter for ProcessAdapter {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Process
    }

    fn validate(&self, definition: &AgentDefinition) -> Result<()> {
        Self::command_of(definition)?;
        config_string_list(definition, "args")?;
        config_env(definition)?;
        Ok(())
    }

    async fn start(&self, spec: &StartSpec) -> Result<InstanceHandle> {
        let def = &spec.definition;
        let command = Self::command_of(def).map_err(|e| RuntimeError::Startup(e.to_string()))?;
        let args = config_string_list(def, "args").map_err(|e| RuntimeError::Startup(e.to_string()))?;
        let env = config_env(def).map_err(|e| RuntimeError::Startup(e.to_string()))?;
        let port = allocate_port().map_err(|e| RuntimeError::Startup(format!("no free port: {e}")))?;

        let mut cmd = Command::new(&command);
        cmd.args(substitute_port(&args, port))
            .env("AGENT_PORT", port.to_string())
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = def.config_str("workdir") {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Startup(format!("failed to spawn `{command}`: {e}")))?;
        let pid = child.id();
        let url = format!("http://127.0.0.1:{port}");
        debug!(?pid, %url, "process spawned, waiting for readiness");

        if let Err(e) = self.await_ready(&url, &mut child).await {
            let _ = child.kill().await;
            return Err(e);
        }

        let handle = InstanceHandle::new(
            RuntimeKind::Process,
            HandleTarget::Process {
                pid,
                url,
                child: Arc::new(Mutex::new(Some(child))),
            },
        );
        info!(instance_id = %handle.id, target = %handle.describe(), "process started");
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
        let (pid, slot) = Self::child_of(instance)?;
        let Some(mut child) = slot.lock().await.take() else {
            return Ok(());
        };

        let signalled = pid.map(send_sigterm).unwrap_or(false);
        if signalled {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(instance_id = %instance.id, %status, "process exited");
                    return Ok(());
                }
                Ok(Err(e)) => warn!(instance_id = %instance.id, error = %e, "wait failed"),
                Err(_) => warn!(instance_id = %instance.id, ?grace, "grace period elapsed, killing"),
            }
        }
        child
            .kill()
            .await
            .map_err(|e| RuntimeError::Execution(format!("kill failed: {e}")))?;
        info!(instance_id = %instance.id, "process killed");
        Ok(())
    }

    async fn health_check(&self, instance: &InstanceHandle, timeout: Duration) -> Result<()> {
        let (_, slot) = Self::child_of(instance)?;
        {
            let mut guard = slot.lock().await;
            match guard.as_mut() {
                None => return Err(RuntimeError::Execution("process already stopped".into())),
                Some(child) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(RuntimeError::Execution(format!("process exited with {status}")));
                    }
                }
            }
        }
        self.transport.health(require_url(instance)?, timeout).await
    }
}
