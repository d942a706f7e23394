//! Token-bucket pacing with adaptive backoff.
//!
//! Each sink owns a [`Throttle`]: one or more token buckets (records per
//! second, bytes per second) plus a rate-adjustment factor that shrinks on
//! downstream errors and recovers on success. The uploader asks for a delay
//! before every call and sleeps it off, so pacing is cooperative rather
//! than enforced.

use std::time::{Duration, Instant};

/// A single bucket. Tokens refill continuously at `rate` per second up to
/// `capacity`; consumption may run the balance negative, in which case the
/// caller owes the returned delay before proceeding.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64) -> Self {
        TokenBucket {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Consume `tokens` and return how long the caller must wait before
    /// acting on them. Zero when the bucket has the balance on hand.
    /// `factor` scales the effective refill rate: a factor below 1 makes
    /// the same debt take proportionally longer to pay down.
    pub fn delay(&mut self, tokens: f64, factor: f64) -> Duration {
        self.refill();
        self.tokens -= tokens;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            let effective_rate = (self.rate * factor).max(f64::MIN_POSITIVE);
            Duration::from_secs_f64(-self.tokens / effective_rate)
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Knobs for the adaptive factor. Defaults follow the usual halve-on-error,
/// creep-back-on-success shape.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleSettings {
    pub backoff: f64,
    pub recovery: f64,
    pub min_factor: f64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        ThrottleSettings {
            backoff: 0.5,
            recovery: 1.25,
            min_factor: 1.0 / 32.0,
        }
    }
}

/// One or more buckets plus adaptive error state.
#[derive(Debug)]
pub struct Throttle {
    buckets: Vec<TokenBucket>,
    settings: ThrottleSettings,
    consecutive_errors: u32,
    rate_adjustment_factor: f64,
}

impl Throttle {
    pub fn new(buckets: Vec<TokenBucket>, settings: ThrottleSettings) -> Self {
        Throttle {
            buckets,
            settings,
            consecutive_errors: 0,
            rate_adjustment_factor: 1.0,
        }
    }

    /// Delay before a call consuming `tokens[i]` from bucket `i`; the
    /// overall delay is the slowest bucket's.
    pub fn get_delay(&mut self, tokens: &[f64]) -> Duration {
        let factor = self.rate_adjustment_factor;
        self.buckets
            .iter_mut()
            .zip(tokens)
            .map(|(bucket, &t)| bucket.delay(t, factor))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn set_success(&mut self) {
        self.consecutive_errors = 0;
        self.rate_adjustment_factor =
            (self.rate_adjustment_factor * self.settings.recovery).min(1.0);
    }

    pub fn set_error(&mut self) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.rate_adjustment_factor =
            (self.rate_adjustment_factor * self.settings.backoff).max(self.settings.min_factor);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn rate_adjustment_factor(&self) -> f64 {
        self.rate_adjustment_factor
    }
}
