use std::sync::Arc;
use std::time::Duration;

use ao_core::config::BreakerConfig;
use ao_core::types::BreakerState;
use ao_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpen};

fn fast_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        failure_window: Duration::from_secs(5),
        reset_timeout: Duration::from_millis(50),
    }
}

fn trip(cb: &CircuitBreaker) {
    for _ in 0..3 {
        cb.try_acquire().expect("closed breaker admits").failure();
    }
}

#[test]
fn config_from_settings_section() {
    let cfg = CircuitBreakerConfig::from(&BreakerConfig {
        failure_threshold: 7,
        failure_window_ms: 1_000,
        reset_timeout_ms: 2_000,
    });
    assert_eq!(cfg.failure_threshold, 7);
    assert_eq!(cfg.failure_window, Duration::from_secs(1));
    assert_eq!(cfg.reset_timeout, Duration::from_secs(2));
}

#[test]
fn starts_closed() {
    let cb = CircuitBreaker::new(fast_config());
    assert_eq!(cb.state(), BreakerState::Closed);
    assert!(cb.is_admissible());
}

#[test]
fn rejects_calls_when_open() {
    let cb = CircuitBreaker::new(fast_config());
    trip(&cb);
    assert_eq!(cb.state(), BreakerState::Open);
    assert_eq!(cb.failure_count(), 3);
    assert!(matches!(cb.try_acquire(), Err(CircuitOpen)));
}

#[tokio::test]
async fn recovers_through_half_open_after_timeout() {
    let cb = CircuitBreaker::new(fast_config());
    trip(&cb);

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(cb.is_admissible());

    let trial = cb.try_acquire().expect("trial admitted");
    assert!(trial.is_trial());
    assert_eq!(cb.state(), BreakerState::HalfOpen);
    trial.success();
    assert_eq!(cb.state(), BreakerState::Closed);
    assert_eq!(cb.failure_count(), 0);
}

#[tokio::test]
async fn failed_trial_reopens() {
    let cb = CircuitBreaker::new(fast_config());
    trip(&cb);
    tokio::time::sleep(Duration::from_millis(70)).await;

    cb.try_acquire().expect("trial admitted").failure();
    assert_eq!(cb.state(), BreakerState::Open);
    assert!(cb.try_acquire().is_err());
}

#[tokio::test]
async fn concurrent_acquirers_get_one_trial() {
    let cb = Arc::new(CircuitBreaker::new(fast_config()));
    trip(&cb);
    tokio::time::sleep(Duration::from_millis(70)).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cb = cb.clone();
        handles.push(tokio::spawn(async move {
            // Keep the permit alive long enough for every task to race.
            let permit = cb.try_acquire().ok();
            tokio::time::sleep(Duration::from_millis(20)).await;
            match permit {
                Some(p) => {
                    p.failure();
                    true
                }
                None => false,
            }
        }));
    }

    let mut admitted = 0;
    for h in handles {
        if h.await.expect("join") {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}
