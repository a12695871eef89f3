use std::sync::{Arc, Mutex, MutexGuard};

use ao_core::types::{BreakerState, DeploymentStatus, HealthState, InstanceId, RuntimeKind};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Control-plane events fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    AgentRegistered {
        agent_id: String,
        agent_type: String,
    },
    AgentUnregistered {
        agent_id: String,
    },
    InstanceStarted {
        agent_id: String,
        instance_id: InstanceId,
        runtime: RuntimeKind,
    },
    InstanceStartFailed {
        agent_id: String,
        reason: String,
    },
    InstanceStopped {
        agent_id: String,
        instance_id: InstanceId,
    },
    HealthChanged {
        agent_id: String,
        instance_id: InstanceId,
        from: HealthState,
        to: HealthState,
    },
    BreakerChanged {
        agent_id: String,
        instance_id: InstanceId,
        from: BreakerState,
        to: BreakerState,
    },
    DeploymentStatusChanged {
        agent_id: String,
        status: DeploymentStatus,
    },
    Scaled {
        agent_id: String,
        from: usize,
        to: usize,
    },
    /// An instance reached its in-flight admission limit.
    AdmissionSaturated {
        agent_type: String,
        instance_id: InstanceId,
    },
}

/// An event with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OrchestratorEvent,
}

/// Broadcast-style event bus built on flume channels.
///
/// Each subscriber receives every event published after it subscribed.
/// Disconnected subscribers are pruned on the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<Envelope>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<Envelope>>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(&self) -> flume::Receiver<Envelope> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        let envelope = Envelope {
            at: Utc::now(),
            event,
        };
        self.senders()
            .retain(|tx| tx.send(envelope.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
