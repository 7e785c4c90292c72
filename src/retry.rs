/*!
 * Retry policy with capped exponential backoff
 *
 * Decisions are plain values: the client feeds an [`ErrorKind`] and the
 * per-operation [`RetryState`] in and gets a [`RetryDecision`] back.
 */

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ErrorKind;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Renew credentials and try again without consuming a retry slot
    Renew,

    /// Sleep for the given delay, then try again with `retries + 1`
    Backoff(Duration),

    /// Terminal; surface the error
    Fail,
}

/// Per-operation counters, rebuilt on every call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts started so far (initial attempt included)
    pub attempts: u32,

    /// Retry slots consumed by throttled/transient failures
    pub retries: u32,

    /// Credential renewals performed
    pub renewals: u32,

    /// Total time spent sleeping between attempts
    pub total_backoff: Duration,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold another state's counters into this one (parts into the whole transfer)
    pub fn absorb(&mut self, other: &RetryState) {
        self.attempts += other.attempts;
        self.retries += other.retries;
        self.renewals += other.renewals;
        self.total_backoff += other.total_backoff;
    }
}

/// Retry policy shared by every operation of one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_min: Duration,
    max_exponent: u32,
    jitter: bool,
    max_renewals: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_min: Duration, max_exponent: u32) -> Self {
        Self {
            max_retries,
            backoff_min,
            max_exponent,
            jitter: false,
            max_renewals: crate::config::DEFAULT_MAX_RENEWALS,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_min: config.backoff_min(),
            max_exponent: config.backoff_max_exponent,
            jitter: config.jitter,
            max_renewals: config.max_renewals,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_renewals(mut self, max_renewals: u32) -> Self {
        self.max_renewals = max_renewals;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_min(&self) -> Duration {
        self.backoff_min
    }

    pub fn max_exponent(&self) -> u32 {
        self.max_exponent
    }

    pub fn max_renewals(&self) -> u32 {
        self.max_renewals
    }

    /// Backoff for retry `retry_count`: `min * 2^min(retry_count, max_exponent)`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(self.max_exponent);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.backoff_min.saturating_mul(multiplier)
    }

    /// Upper bound on any single sleep
    pub fn max_backoff(&self) -> Duration {
        self.backoff(self.max_exponent)
    }

    /// Delay actually slept; with jitter it lands in `[backoff/2, backoff]`
    pub fn sleep_duration(&self, retry_count: u32) -> Duration {
        let delay = self.backoff(retry_count);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range(0.5..=1.0);
        delay.mul_f64(factor).min(delay)
    }

    /// Decide the next transition for a failure of `kind`
    pub fn evaluate(&self, kind: ErrorKind, state: &RetryState) -> RetryDecision {
        match kind {
            ErrorKind::ExpiredCredentials if state.renewals < self.max_renewals => {
                RetryDecision::Renew
            }
            ErrorKind::ThrottledOrTransient if state.retries < self.max_retries => {
                RetryDecision::Backoff(self.sleep_duration(state.retries))
            }
            _ => RetryDecision::Fail,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
