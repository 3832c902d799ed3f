//! Per-node circuit breaker.
//!
//! `Closed -> Open` when the sliding window holds at least
//! `min_request_threshold` requests with a failure rate at or above the
//! threshold. `Open -> HalfOpen` after `open_timeout`. A success streak of
//! `recovery_threshold` closes the breaker; any half-open failure reopens
//! it. Calls while `Open` fail fast with a retry-after hint.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::RouterConfig;

/// Observable state of a breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub window: Duration,
    pub min_request_threshold: u64,
    pub failure_rate_threshold: f64,
    pub open_timeout: Duration,
    pub recovery_threshold: u32,
}

impl From<&RouterConfig> for BreakerConfig {
    fn from(cfg: &RouterConfig) -> Self {
        Self {
            window: Duration::from_millis(cfg.breaker_window),
            min_request_threshold: cfg.min_request_threshold,
            failure_rate_threshold: cfg.failure_rate_threshold,
            open_timeout: Duration::from_millis(cfg.open_timeout),
            recovery_threshold: cfg.breaker_recovery_threshold,
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    /// Outcomes within the sliding window, oldest first.
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

/// A circuit breaker guarding one target node.
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    /// Whether a call may proceed. `Err` carries the retry-after hint.
    pub fn allow(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().unwrap();
        self.tick(&mut inner);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                Err(self.cfg.open_timeout.saturating_sub(elapsed))
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.tick(&mut inner);
        match inner.state {
            BreakerState::Closed => {
                inner.window.push_back((Instant::now(), true));
                self.prune(&mut inner);
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.cfg.recovery_threshold {
                    tracing::debug!("circuit closed after recovery streak");
                    inner.state = BreakerState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    inner.half_open_successes = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.tick(&mut inner);
        match inner.state {
            BreakerState::Closed => {
                inner.window.push_back((Instant::now(), false));
                self.prune(&mut inner);
                let requests = inner.window.len() as u64;
                let failures = inner.window.iter().filter(|(_, ok)| !ok).count() as f64;
                let rate = failures / inner.window.len().max(1) as f64;
                if requests >= self.cfg.min_request_threshold
                    && rate >= self.cfg.failure_rate_threshold
                {
                    tracing::warn!(rate, requests, "circuit opened");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                // One failure sends a probing breaker straight back to open.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        self.tick(&mut inner);
        inner.state
    }

    /// Time-driven transition: an open breaker starts probing after the
    /// open timeout.
    fn tick(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            let expired = inner
                .opened_at
                .map(|at| at.elapsed() >= self.cfg.open_timeout)
                .unwrap_or(true);
            if expired {
                inner.state = BreakerState::HalfOpen;
                inner.half_open_successes = 0;
            }
        }
    }

    fn prune(&self, inner: &mut BreakerInner) {
        while let Some((at, _)) = inner.window.front() {
            if at.elapsed() > self.cfg.window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(open_timeout: Duration) -> BreakerConfig {
        BreakerConfig {
            window: Duration::from_secs(60),
            min_request_threshold: 5,
            failure_rate_threshold: 0.5,
            open_timeout,
            recovery_threshold: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn trips_at_failure_rate_and_recovers() {
        let breaker = CircuitBreaker::new(cfg(Duration::from_secs(30)));

        // 10 requests, 9 failures: trips once past the minimum volume.
        breaker.record_success();
        for _ in 0..9 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Calls fail fast while open, with a retry-after hint.
        let retry_after = breaker.allow().unwrap_err();
        assert!(retry_after <= Duration::from_secs(30));

        // After the open timeout the breaker probes.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow().is_ok());

        // Three consecutive successes close it.
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn below_volume_threshold_never_trips() {
        let breaker = CircuitBreaker::new(cfg(Duration::from_secs(30)));
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(cfg(Duration::from_secs(5)));
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.allow().is_err());
    }
}
