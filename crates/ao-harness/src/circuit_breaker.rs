use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ao_core::config::BreakerConfig;
use ao_core::types::BreakerState;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Returned by [`CircuitBreaker::try_acquire`] when the instance must not be
/// contacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit is open, refusing call")]
pub struct CircuitOpen;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures, all inside `failure_window`, before the circuit opens.
    pub failure_threshold: u32,
    /// A failure arriving later than this after the first of the streak restarts the count.
    pub failure_window: Duration,
    /// How long the circuit stays open before a single trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for CircuitBreakerConfig {
    fn from(cfg: &BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            failure_window: Duration::from_millis(cfg.failure_window_ms),
            reset_timeout: Duration::from_millis(cfg.reset_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure state machine
// ---------------------------------------------------------------------------

/// Complete breaker state. Plain data so the transition function stays pure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerCore {
    pub state: BreakerState,
    pub failure_count: u32,
    pub streak_started_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
    pub opened_at: Option<Instant>,
    /// Set while the single half-open trial call is outstanding.
    pub trial_in_flight: bool,
}

impl Default for BreakerCore {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            streak_started_at: None,
            last_failure_at: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerInput {
    /// A caller wants to send a request.
    Acquire,
    /// The call completed without a transport failure.
    Success,
    /// The call failed at the transport level or timed out.
    Failure,
    /// An admitted trial call was cancelled before it reported an outcome.
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    /// Admitted as the one half-open probe.
    AdmitTrial,
    Reject,
    Recorded,
}

impl BreakerCore {
    /// Whether an `Acquire` at `now` would be admitted. Does not change state.
    pub fn is_admissible(&self, now: Instant, cfg: &CircuitBreakerConfig) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => self.reset_elapsed(now, cfg),
            BreakerState::HalfOpen => !self.trial_in_flight,
        }
    }

    fn reset_elapsed(&self, now: Instant, cfg: &CircuitBreakerConfig) -> bool {
        self.opened_at
            .map(|at| now.saturating_duration_since(at) >= cfg.reset_timeout)
            .unwrap_or(true)
    }
}

/// Advance the breaker by one input.
pub fn transition(
    core: BreakerCore,
    input: BreakerInput,
    now: Instant,
    cfg: &CircuitBreakerConfig,
) -> (BreakerCore, Verdict) {
    use BreakerInput::*;
    use BreakerState::*;

    let mut next = core;
    let verdict = match (core.state, input) {
        (Closed, Acquire) => Verdict::Admit,
        (Open, Acquire) if core.reset_elapsed(now, cfg) => {
            next.state = HalfOpen;
            next.trial_in_flight = true;
            Verdict::AdmitTrial
        }
        (Open, Acquire) => Verdict::Reject,
        (HalfOpen, Acquire) if !core.trial_in_flight => {
            next.trial_in_flight = true;
            Verdict::AdmitTrial
        }
        (HalfOpen, Acquire) => Verdict::Reject,

        (Closed, Success) => {
            next.failure_count = 0;
            next.streak_started_at = None;
            Verdict::Recorded
        }
        (HalfOpen, Success) => {
            next = BreakerCore {
                last_failure_at: core.last_failure_at,
                ..BreakerCore::default()
            };
            Verdict::Recorded
        }
        // A call admitted before the circuit opened finished late.
        (Open, Success) => Verdict::Recorded,

        (Closed, Failure) => {
            let in_window = core
                .streak_started_at
                .map(|start| now.saturating_duration_since(start) <= cfg.failure_window)
                .unwrap_or(false);
            if in_window {
                next.failure_count = core.failure_count.saturating_add(1);
            } else {
                next.failure_count = 1;
                next.streak_started_at = Some(now);
            }
            next.last_failure_at = Some(now);
            if next.failure_count >= cfg.failure_threshold {
                next.state = Open;
                next.opened_at = Some(now);
            }
            Verdict::Recorded
        }
        (HalfOpen, Failure) => {
            next.state = Open;
            next.opened_at = Some(now);
            next.last_failure_at = Some(now);
            next.trial_in_flight = false;
            next.failure_count = core.failure_count.saturating_add(1);
            Verdict::Recorded
        }
        (Open, Failure) => {
            next.last_failure_at = Some(now);
            Verdict::Recorded
        }

        (HalfOpen, Abandon) => {
            next.trial_in_flight = false;
            Verdict::Recorded
        }
        (_, Abandon) => Verdict::Recorded,
    };
    (next, verdict)
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// A state change observed while applying an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// Shared per-instance breaker. Cloning shares state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerCore>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerCore::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        // The core is plain data; a poisoned lock still holds a valid value.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerCore {
        *self.lock()
    }

    /// Peek used by the selector: true unless the call would be rejected.
    pub fn is_admissible(&self) -> bool {
        self.lock().is_admissible(Instant::now(), &self.config)
    }

    fn apply(&self, input: BreakerInput) -> (Verdict, Option<BreakerTransition>) {
        let mut guard = self.lock();
        let before = guard.state;
        let (next, verdict) = transition(*guard, input, Instant::now(), &self.config);
        *guard = next;
        let change = (before != next.state).then_some(BreakerTransition {
            from: before,
            to: next.state,
        });
        drop(guard);

        if let Some(t) = change {
            match t.to {
                BreakerState::Open => warn!(
                    from = %t.from,
                    failures = next.failure_count,
                    "circuit breaker opened"
                ),
                _ => info!(from = %t.from, to = %t.to, "circuit breaker transition"),
            }
        }
        (verdict, change)
    }

    /// Ask permission to call the instance.
    ///
    /// The returned permit must be settled with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]; dropping it unsettled releases a half-open
    /// trial slot without counting an outcome.
    pub fn try_acquire(&self) -> Result<BreakerPermit, CircuitOpen> {
        let (verdict, change) = self.apply(BreakerInput::Acquire);
        match verdict {
            Verdict::Admit | Verdict::AdmitTrial => Ok(BreakerPermit {
                breaker: self.clone(),
                trial: verdict == Verdict::AdmitTrial,
                settled: false,
                acquire_transition: change,
            }),
            _ => Err(CircuitOpen),
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerPermit
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    trial: bool,
    settled: bool,
    acquire_transition: Option<BreakerTransition>,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Open to HalfOpen change caused by granting this permit, if any.
    pub fn acquire_transition(&self) -> Option<BreakerTransition> {
        self.acquire_transition
    }

    pub fn success(mut self) -> Option<BreakerTransition> {
        self.settled = true;
        self.breaker.apply(BreakerInput::Success).1
    }

    pub fn failure(mut self) -> Option<BreakerTransition> {
        self.settled = true;
        self.breaker.apply(BreakerInput::Failure).1
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.apply(BreakerInput::Abandon);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
        }
    }

    fn feed(mut core: BreakerCore, inputs: &[BreakerInput], now: Instant) -> BreakerCore {
        for input in inputs {
            core = transition(core, *input, now, &cfg()).0;
        }
        core
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let now = Instant::now();
        let core = feed(
            BreakerCore::default(),
            &[BreakerInput::Failure, BreakerInput::Failure],
            now,
        );
        assert_eq!(core.state, BreakerState::Closed);
        let core = feed(core, &[BreakerInput::Failure], now);
        assert_eq!(core.state, BreakerState::Open);
        assert_eq!(core.opened_at, Some(now));
    }

    #[test]
    fn success_resets_the_streak() {
        let now = Instant::now();
        let core = feed(
            BreakerCore::default(),
            &[
                BreakerInput::Failure,
                BreakerInput::Failure,
                BreakerInput::Success,
                BreakerInput::Failure,
                BreakerInput::Failure,
            ],
            now,
        );
        assert_eq!(core.state, BreakerState::Closed);
        assert_eq!(core.failure_count, 2);
    }

    #[test]
    fn failures_outside_window_restart_count() {
        let start = Instant::now();
        let core = feed(
            BreakerCore::default(),
            &[BreakerInput::Failure, BreakerInput::Failure],
            start,
        );
        let later = start + Duration::from_secs(11);
        let (core, _) = transition(core, BreakerInput::Failure, later, &cfg());
        assert_eq!(core.state, BreakerState::Closed);
        assert_eq!(core.failure_count, 1);
        assert_eq!(core.streak_started_at, Some(later));
    }

    #[test]
    fn open_rejects_until_reset_timeout() {
        let now = Instant::now();
        let open = feed(BreakerCore::default(), &[BreakerInput::Failure; 3], now);

        let (still_open, verdict) = transition(
            open,
            BreakerInput::Acquire,
            now + Duration::from_secs(29),
            &cfg(),
        );
        assert_eq!(verdict, Verdict::Reject);
        assert_eq!(still_open.state, BreakerState::Open);

        let (half, verdict) = transition(
            open,
            BreakerInput::Acquire,
            now + Duration::from_secs(30),
            &cfg(),
        );
        assert_eq!(verdict, Verdict::AdmitTrial);
        assert_eq!(half.state, BreakerState::HalfOpen);
        assert!(half.trial_in_flight);
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let now = Instant::now();
        let open = feed(BreakerCore::default(), &[BreakerInput::Failure; 3], now);
        let later = now + Duration::from_secs(31);
        let (half, first) = transition(open, BreakerInput::Acquire, later, &cfg());
        let (_, second) = transition(half, BreakerInput::Acquire, later, &cfg());
        assert_eq!(first, Verdict::AdmitTrial);
        assert_eq!(second, Verdict::Reject);
    }

    #[test]
    fn trial_outcome_decides_next_state() {
        let now = Instant::now();
        let open = feed(BreakerCore::default(), &[BreakerInput::Failure; 3], now);
        let later = now + Duration::from_secs(31);
        let (half, _) = transition(open, BreakerInput::Acquire, later, &cfg());

        let (closed, _) = transition(half, BreakerInput::Success, later, &cfg());
        assert_eq!(closed.state, BreakerState::Closed);
        assert_eq!(closed.failure_count, 0);

        let (reopened, _) = transition(half, BreakerInput::Failure, later, &cfg());
        assert_eq!(reopened.state, BreakerState::Open);
        assert_eq!(reopened.opened_at, Some(later));
        assert!(!reopened.trial_in_flight);
    }

    #[test]
    fn abandoned_trial_frees_the_slot() {
        let now = Instant::now();
        let open = feed(BreakerCore::default(), &[BreakerInput::Failure; 3], now);
        let later = now + Duration::from_secs(31);
        let (half, _) = transition(open, BreakerInput::Acquire, later, &cfg());
        let (half, _) = transition(half, BreakerInput::Abandon, later, &cfg());
        assert_eq!(half.state, BreakerState::HalfOpen);
        assert!(half.is_admissible(later, &cfg()));
    }

    #[test]
    fn breaker_reports_transitions() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        let change = breaker.try_acquire().unwrap().failure();
        assert_eq!(
            change,
            Some(BreakerTransition {
                from: BreakerState::Closed,
                to: BreakerState::Open
            })
        );
        assert_eq!(breaker.try_acquire().unwrap_err(), CircuitOpen);
        assert!(!breaker.is_admissible());
    }

    #[test]
    fn dropped_trial_permit_releases_half_open_slot() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            failure_window: Duration::from_secs(10),
            reset_timeout: Duration::ZERO,
        });
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(breaker.try_acquire().is_err());
        drop(trial);

        let retry = breaker.try_acquire().unwrap();
        assert!(retry.is_trial());
        retry.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
