use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::shutdown::ShutdownSignal;

/// Spawn a loop that runs `tick` every `period` until shutdown.
///
/// The first tick fires after one full period. A tick that is still running
/// when shutdown fires is allowed to finish; the loop then exits and confirms
/// drain.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    signal: &ShutdownSignal,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let mut listener = signal.listener();
    let guard = signal.guard();
    tokio::spawn(async move {
        let _guard = guard;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Consume the immediate tick so loops don't all fire at t=0.
        interval.tick().await;
        info!(loop_name = name, period_ms = period.as_millis() as u64, "background loop started");

        loop {
            tokio::select! {
                _ = listener.cancelled() => break,
                _ = interval.tick() => {
                    debug!(loop_name = name, "tick");
                    tick().await;
                }
            }
        }
        info!(loop_name = name, "background loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_until_shutdown_and_confirms_drain() {
        let mut signal = ShutdownSignal::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = spawn_periodic("test", Duration::from_millis(5), &signal, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        signal.trigger();
        handle.await.expect("loop exits");

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert!(signal
            .wait_for_drain(1, Duration::from_millis(50))
            .await
            .is_complete());
    }
}
