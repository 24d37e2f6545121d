//! Retry and circuit-breaker guards for ledger traffic.
//!
//! Retries apply to transient failures only; terminal failures surface
//! immediately. The breaker opens after a run of consecutive transient
//! failures and admits a single probe after its cooldown.

use crate::error::{MediatorError, MediatorResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the computed delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = (self.base_delay_ms as f64) * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay_ms as f64);
        let spread = capped * self.jitter;
        let jittered = capped - spread + fastrand::f64() * 2.0 * spread;
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Run `f`, retrying transient errors with backoff. Terminal errors and
    /// exhausted budgets return the last error unchanged.
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> MediatorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MediatorResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    debug!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(max_retries = self.max_retries, error = %err, "retry budget exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Fails fast after sustained transient failures; a single half-open probe
/// closes the circuit again.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
            cooldown,
            opened_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Admission check. `Err(CircuitOpen)` means fail fast without dialing.
    /// At most one caller wins the half-open probe per cooldown.
    pub fn admit(&self) -> MediatorResult<()> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(MediatorError::CircuitOpen),
            CircuitState::Open => {
                let mut opened_at = self.opened_at.lock();
                let elapsed = opened_at.map(|t| t.elapsed()).unwrap_or(self.cooldown);
                if elapsed >= self.cooldown {
                    info!("circuit breaker half-open, admitting probe");
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::Release);
                    *opened_at = None;
                    Ok(())
                } else {
                    Err(MediatorError::CircuitOpen)
                }
            }
        }
    }

    /// Record the outcome of an admitted call (`None` = success). Terminal
    /// failures do not count toward the failure run; the ledger answered,
    /// just unhelpfully.
    pub fn record(&self, outcome: Option<&MediatorError>) {
        match outcome {
            None => {
                if self.state() != CircuitState::Closed {
                    info!("circuit breaker closed after successful probe");
                }
                self.state
                    .store(CircuitState::Closed as u8, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Release);
            }
            Some(err) if err.is_transient() => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                let reopen = self.state() == CircuitState::HalfOpen;
                if reopen || failures >= self.threshold {
                    if reopen {
                        warn!("circuit breaker probe failed, reopening");
                    } else {
                        warn!(failures, threshold = self.threshold, "circuit breaker opening");
                    }
                    self.state.store(CircuitState::Open as u8, Ordering::Release);
                    *self.opened_at.lock() = Some(Instant::now());
                }
            }
            Some(_) => {
                self.consecutive_failures.store(0, Ordering::Release);
                if self.state() == CircuitState::HalfOpen {
                    // The probe reached the ledger; that is recovery enough.
                    self.state
                        .store(CircuitState::Closed as u8, Ordering::Release);
                }
            }
        }
    }
}
