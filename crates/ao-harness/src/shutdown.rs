use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative shutdown for the orchestrator's background loops.
///
/// Each loop takes a [`ShutdownListener`] and a [`ShutdownGuard`]; the daemon
/// calls [`trigger`](Self::trigger) and then waits for every guard to drop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    /// A listener that also resolves when shutdown was triggered before it
    /// was created.
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.trigger.subscribe(),
            shutting_down: self.shutting_down.clone(),
        }
    }

    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            signal: self.clone(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!(listeners = self.trigger.receiver_count(), "shutdown triggered");
            let _ = self.trigger.send(());
        }
    }

    fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    /// Wait until `expected` guards have dropped or `timeout` elapses.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = *self.drain_rx.borrow();
            if current >= expected {
                info!(count = current, "background loops drained");
                return DrainResult::Complete(current);
            }

            match tokio::time::timeout_at(deadline, self.drain_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainResult::Complete(*self.drain_rx.borrow()),
                Err(_) => {
                    let confirmed = *self.drain_rx.borrow();
                    warn!(confirmed, expected, "drain timed out");
                    return DrainResult::Timeout {
                        confirmed,
                        expected,
                    };
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ShutdownListener
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ShutdownListener {
    rx: broadcast::Receiver<()>,
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&mut self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        // Lagged or closed both mean the sender fired or went away.
        let _ = self.rx.recv().await;
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard
// ---------------------------------------------------------------------------

/// Confirms drain when dropped.
#[derive(Debug)]
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn listener_created_after_trigger_resolves() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut listener = signal.listener();
        tokio::time::timeout(Duration::from_millis(50), listener.cancelled())
            .await
            .expect("late listener should resolve immediately");
    }

    #[tokio::test]
    async fn listener_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.listener();
        let waiter = tokio::spawn(async move { listener.cancelled().await });
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("listener woke")
            .expect("task joined");
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let mut signal = ShutdownSignal::new();
        let g1 = signal.guard();
        let g2 = signal.guard();
        signal.trigger();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(g1);
            drop(g2);
        });

        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(result, DrainResult::Complete(2));
    }

    #[tokio::test]
    async fn drain_times_out_with_outstanding_guard() {
        let mut signal = ShutdownSignal::new();
        let _held = signal.guard();
        signal.trigger();

        let result = signal.wait_for_drain(1, Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
    }
}
