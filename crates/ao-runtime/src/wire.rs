//! JSON-over-HTTP protocol spoken by remote, container and process agents.
//!
//! `POST {base}/execute` with `{"task": Task}` answers
//! `{"success": bool, "data": any, "error": string?}`; `GET {base}/health`
//! answers any 2xx when the agent is ready.

use std::time::Duration;

use ao_core::config::RuntimeConfig;
use ao_core::types::{Task, TaskOutput};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::adapter::{Result, RuntimeError};

#[derive(Debug, Serialize)]
pub struct ExecuteRequest<'a> {
    pub task: &'a Task,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    connect_retries: u32,
    connect_backoff: Duration,
}

impl HttpTransport {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            connect_retries: config.connect_retries,
            connect_backoff: Duration::from_millis(config.connect_backoff_ms),
        }
    }

    fn join(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }

    /// Send a request, retrying connection failures with exponential backoff
    /// while time remains before `deadline`.
    async fn send_with_retry<F>(&self, deadline: Instant, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut backoff = self.connect_backoff;
        let mut attempt = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RuntimeError::Timeout(Duration::ZERO));
            }
            match build().timeout(remaining).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_timeout() => return Err(RuntimeError::Timeout(remaining)),
                Err(e) if e.is_connect() && attempt < self.connect_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "connect failed, retrying");
                    let pause = backoff.min(deadline.saturating_duration_since(Instant::now()));
                    tokio::time::sleep(pause).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(RuntimeError::Execution(e.to_string())),
            }
        }
    }

    pub async fn execute(&self, base: &str, task: &Task, timeout: Duration) -> Result<TaskOutput> {
        let deadline = Instant::now() + timeout;
        let url = Self::join(base, "execute");
        let body = ExecuteRequest { task };
        let resp = self
            .send_with_retry(deadline, || self.client.post(&url).json(&body))
            .await
            .map_err(|e| match e {
                RuntimeError::Timeout(_) => RuntimeError::Timeout(timeout),
                other => other,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RuntimeError::Execution(format!("agent answered {status}")));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let bytes = match tokio::time::timeout(remaining, resp.bytes()).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(RuntimeError::Execution(e.to_string())),
            Err(_) => return Err(RuntimeError::Timeout(timeout)),
        };
        serde_json::from_slice::<TaskOutput>(&bytes)
            .map_err(|e| RuntimeError::Execution(format!("malformed response: {e}")))
    }

    pub async fn health(&self, base: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let url = Self::join(base, "health");
        let resp = self
            .send_with_retry(deadline, || self.client.get(&url))
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(RuntimeError::Execution(format!(
                "health endpoint answered {}",
                resp.status()
            )))
        }
    }

    /// Poll the health endpoint until it answers or `timeout` elapses.
    pub async fn wait_ready(&self, base: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut last_error = String::from("never probed");
        while Instant::now() < deadline {
            let probe = Duration::from_millis(500).min(deadline.saturating_duration_since(Instant::now()));
            match self.health(base, probe).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e.to_string(),
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(RuntimeError::Startup(format!(
            "{base} not ready after {timeout:?}: {last_error}"
        )))
    }
}
