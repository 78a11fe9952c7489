//! Retry and circuit breaking around [`GenerationService::open`].
//!
//! Only the request/response-head phase is retried. A body stream that has
//! been handed out belongs to the session; failures inside it surface to the
//! orchestrator unchanged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};

use hookline_core::errors::GenerationError;
use hookline_core::request::GenerationBody;
use hookline_core::service::{ByteStream, GenerationService};

#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the backoff added or removed at random.
    pub jitter_factor: f64,
    /// Consecutive exhausted opens before the breaker opens.
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Cooldown elapsed; a single trial decides.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    opened_at: Option<Instant>,
    failures: u32,
    trial_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            opened_at: None,
            failures: 0,
            trial_in_flight: false,
        }
    }

    /// `None` refuses the call; `Some(true)` admits it as the half-open trial.
    fn admit(&mut self, cooldown: Duration) -> Option<bool> {
        match self.state {
            BreakerState::Closed => Some(false),
            BreakerState::Open => {
                let cooled = self.opened_at.map_or(true, |at| at.elapsed() >= cooldown);
                if !cooled {
                    return None;
                }
                self.state = BreakerState::HalfOpen;
                self.trial_in_flight = true;
                Some(true)
            }
            BreakerState::HalfOpen if self.trial_in_flight => None,
            BreakerState::HalfOpen => {
                self.trial_in_flight = true;
                Some(true)
            }
        }
    }

    fn release_trial(&mut self, trial: bool) {
        if trial {
            self.trial_in_flight = false;
        }
    }

    /// Returns true when this closed a breaker that was not closed.
    fn on_success(&mut self, trial: bool) -> bool {
        self.release_trial(trial);
        self.failures = 0;
        self.opened_at = None;
        std::mem::replace(&mut self.state, BreakerState::Closed) != BreakerState::Closed
    }

    /// Returns true when this failure opened the breaker.
    fn on_failure(&mut self, threshold: u32, trial: bool) -> bool {
        self.release_trial(trial);
        self.failures = self.failures.saturating_add(1);
        let trip = self.state == BreakerState::HalfOpen || self.failures >= threshold.max(1);
        if trip && self.state != BreakerState::Open {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
            return true;
        }
        false
    }
}

/// Wraps a [`GenerationService`] with retry and a circuit breaker.
///
/// - Retryable errors from `open` are retried with exponential backoff and
///   jitter, or after the server's `retry-after` when it sent one.
/// - Fatal errors return immediately and do not count against the breaker.
/// - After `circuit_breaker_threshold` consecutive exhausted opens the breaker
///   fails fast with a 503 until the cooldown passes; one trial then decides.
pub struct ReliableService<S: GenerationService> {
    inner: S,
    config: ReliableConfig,
    breaker: Mutex<Breaker>,
    retries: AtomicU64,
}

impl<S: GenerationService> ReliableService<S> {
    pub fn new(inner: S, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            breaker: Mutex::new(Breaker::new()),
            retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: S) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().state
    }

    /// Ok(true) when the caller is the half-open trial.
    fn admit(&self) -> Result<bool, GenerationError> {
        self.breaker
            .lock()
            .admit(self.config.circuit_breaker_cooldown)
            .ok_or_else(circuit_open)
    }

    fn backoff(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let exp = self
            .config
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.config.max_delay);
        let spread = self.config.jitter_factor * rand::rng().random_range(-1.0..=1.0);
        exp.mul_f64((1.0 + spread).max(0.0))
            .max(Duration::from_millis(1))
    }
}

fn circuit_open() -> GenerationError {
    GenerationError::ServerError {
        status: 503,
        body: "circuit open: generation service unavailable".into(),
    }
}

#[async_trait]
impl<S: GenerationService> GenerationService for ReliableService<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn open(&self, body: &GenerationBody) -> Result<ByteStream, GenerationError> {
        let trial = self.admit()?;

        let mut attempt = 0;
        loop {
            let err = match self.inner.open(body).await {
                Ok(stream) => {
                    if self.breaker.lock().on_success(trial) {
                        info!(service = self.inner.name(), "circuit breaker closed");
                    }
                    return Ok(stream);
                }
                Err(e) => e,
            };

            if err.is_fatal() {
                self.breaker.lock().release_trial(trial);
                return Err(err);
            }
            if !err.is_retryable() || attempt >= self.config.max_retries {
                let opened = self
                    .breaker
                    .lock()
                    .on_failure(self.config.circuit_breaker_threshold, trial);
                if opened {
                    warn!(
                        service = self.inner.name(),
                        cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                        error = %err,
                        "circuit breaker opened"
                    );
                }
                return Err(err);
            }

            let delay = self.backoff(attempt, err.suggested_delay());
            self.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying generation request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;

            // Another caller may have opened the breaker while this one slept.
            if !trial && self.breaker_state() == BreakerState::Open {
                return Err(circuit_open());
            }
        }
    }
}
