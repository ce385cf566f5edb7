//! Exponential backoff policy.
//!
//! A [`RetryPolicy`] maps an attempt number to a delay:
//! `min(initial_delay × base^attempt, max_delay)`, optionally scaled by a
//! uniform jitter multiplier in `[0.8, 1.2]`. The policy itself holds no
//! state; [`RetryPolicy::execute`] drives an async operation through it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lower bound of the jitter multiplier.
pub const JITTER_MIN: f64 = 0.8;
/// Upper bound of the jitter multiplier.
pub const JITTER_MAX: f64 = 1.2;

/// Backoff configuration for retried operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay for attempt 0, in seconds.
    pub initial_delay_secs: f64,
    /// Exponential base.
    pub base: f64,
    /// Upper bound on the un-jittered delay, in seconds.
    pub max_delay_secs: f64,
    /// Scale each delay by a random factor in `[0.8, 1.2]`.
    pub jitter: bool,
    /// Fixed seed for the jitter generator. `None` draws from the thread RNG.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_secs: 1.0,
            base: 2.0,
            max_delay_secs: 60.0,
            jitter: false,
            seed: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given retry budget and default timing.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// The policy the task queue applies to failed tasks: `min(2^n, 3600)` seconds.
    pub fn task_backoff() -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay_secs: 1.0,
            base: 2.0,
            max_delay_secs: 3600.0,
            jitter: false,
            seed: None,
        }
    }

    /// A policy that retries immediately. Mostly useful in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_secs: 0.0,
            max_delay_secs: 0.0,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_secs = delay.as_secs_f64();
        self
    }

    pub fn with_base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_secs = delay.as_secs_f64();
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks that delays can only grow with the attempt number.
    ///
    /// Policies read from workflow files are not range-checked by serde, so
    /// callers validate them before use.
    pub fn validate(&self) -> Result<(), String> {
        if !self.initial_delay_secs.is_finite() || self.initial_delay_secs < 0.0 {
            return Err(format!(
                "initial_delay_secs must be a non-negative number, got {}",
                self.initial_delay_secs
            ));
        }
        if !self.base.is_finite() || self.base < 1.0 {
            return Err(format!("base must be at least 1, got {}", self.base));
        }
        if self.max_delay_secs.is_nan() || self.max_delay_secs < 0.0 {
            return Err(format!(
                "max_delay_secs must be non-negative, got {}",
                self.max_delay_secs
            ));
        }
        Ok(())
    }

    /// Delay to wait after the given (zero-based) attempt.
    ///
    /// Without jitter the result is non-decreasing in `attempt` and capped at
    /// `max_delay`. With jitter it never exceeds `max_delay × 1.2`.
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_secs * self.base.powi(exponent);
        let max_delay = self.max_delay_secs.max(0.0);
        let mut secs = if raw.is_finite() {
            raw.clamp(0.0, max_delay)
        } else {
            max_delay
        };

        if self.jitter {
            let factor = self.create_rng(attempt).random_range(JITTER_MIN..=JITTER_MAX);
            secs *= factor;
        }

        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// Run `operation` until it succeeds, the retry budget is spent, or it
    /// returns an error that `is_retryable` rejects.
    ///
    /// The operation receives the zero-based attempt number.
    pub async fn execute<T, E, F, Fut, P>(&self, mut operation: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0u32;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.max_retries && is_retryable(&err) => {
                    let delay = self.get_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn create_rng(&self, attempt: u32) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(u64::from(attempt))),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        }
    }
}
