//! Backoff delay calculation.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MIN_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 300_000;
pub const DEFAULT_JITTER_PCT: f64 = 0.20;

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `min_delay * 2^(attempt-1)`
    Exponential,
    /// `max(min_delay, attempt * step_ms)`
    Linear { step_ms: u64 },
    /// Retry on the next poll cycle.
    None,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("attempt numbers start at 1 (got {0})")]
    InvalidAttempt(u32),
}

/// Delay bounds and jitter shared by every strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the base delay used as a symmetric jitter window.
    pub jitter_pct: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_pct: DEFAULT_JITTER_PCT,
        }
    }
}

/// Pure backoff calculator: `(attempt, strategy) -> delay`.
///
/// Deterministic except for jitter, which is drawn from the caller's RNG in
/// [`Backoff::delay_with_rng`] so tests can pin it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay before jitter, in milliseconds. Never exceeds `max_delay_ms`.
    pub fn base_delay_ms(&self, attempt: u32, strategy: BackoffStrategy) -> Result<u64, BackoffError> {
        if attempt == 0 {
            return Err(BackoffError::InvalidAttempt(attempt));
        }

        let min = self.config.min_delay_ms;
        let max = self.config.max_delay_ms;

        let base = match strategy {
            BackoffStrategy::None => 0,
            BackoffStrategy::Exponential => {
                let shift = attempt - 1;
                let factor = if shift >= 63 { u64::MAX } else { 1u64 << shift };
                min.saturating_mul(factor).min(max)
            }
            BackoffStrategy::Linear { step_ms } => {
                let linear = u64::from(attempt).saturating_mul(step_ms);
                linear.max(min).min(max)
            }
        };

        Ok(base)
    }

    /// Jittered delay using the thread-local RNG.
    pub fn delay(&self, attempt: u32, strategy: BackoffStrategy) -> Result<Duration, BackoffError> {
        self.delay_with_rng(attempt, strategy, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        strategy: BackoffStrategy,
        rng: &mut R,
    ) -> Result<Duration, BackoffError> {
        let base = self.base_delay_ms(attempt, strategy)?;
        Ok(Duration::from_millis(apply_jitter(
            base,
            self.config.jitter_pct,
            rng,
        )))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

/// Draw uniformly from `[base*(1-pct), base*(1+pct)]`, clamped at zero.
///
/// The result is rounded inward so it never leaves the window.
pub fn apply_jitter<R: Rng + ?Sized>(base_ms: u64, jitter_pct: f64, rng: &mut R) -> u64 {
    let pct = jitter_pct.clamp(0.0, 1.0);
    if base_ms == 0 || pct == 0.0 {
        return base_ms;
    }

    let base = base_ms as f64;
    let lo = (base * (1.0 - pct)).max(0.0);
    let hi = base * (1.0 + pct);
    let sampled = rng.gen_range(lo..=hi).round();

    let floor = lo.ceil();
    let ceil = hi.floor();
    sampled.clamp(floor, ceil) as u64
}
