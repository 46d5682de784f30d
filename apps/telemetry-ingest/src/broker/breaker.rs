use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct BreakerState {
    open: bool,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Consecutive-failure gate in front of the broker.
///
/// There is no half-open state: once the cooldown has passed since the last
/// failure, requests are let through again and their outcome decides.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allow_request(&self) -> bool {
        let state = self.lock();
        if !state.open {
            return true;
        }
        state
            .last_failure
            .map(|at| at.elapsed() > self.cooldown)
            .unwrap_or(true)
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.open {
            tracing::info!(failures = state.failures, "circuit breaker closed; broker reachable again");
        }
        state.open = false;
        state.failures = 0;
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.failures = state.failures.saturating_add(1);
        state.last_failure = Some(Instant::now());
        if !state.open && state.failures >= self.threshold {
            state.open = true;
            tracing::warn!(
                failures = state.failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker opened; spilling batches locally"
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    #[cfg(test)]
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }
}
