//! Retry policy for failed dispatches.
//!
//! A policy is a pure function from (base time, attempt index) to the next
//! retry time, or nothing once the attempt budget is spent. Rounding to
//! whole seconds happens when the schedule entity stores the result, not
//! here, so sub-second intervals keep their exact spacing for the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors rejected by the retry policy constructor.
///
/// The admin validator surfaces these before anything is persisted; the
/// engine never re-validates a stored policy.
#[derive(Debug, Error)]
pub enum RetryPolicyError {
    /// Unknown strategy name.
    #[error("invalid strategy type")]
    InvalidStrategy,

    /// Retry count must be positive.
    #[error("count must be greater than zero")]
    InvalidCount,

    /// Interval string was empty.
    #[error("missing interval")]
    MissingInterval,

    /// Interval string did not parse as a duration.
    #[error("invalid interval")]
    InvalidInterval,
}

/// Spacing strategy between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// interval, interval, interval, ...
    Constant,
    /// interval, 2×interval, 3×interval, ...
    Linear,
    /// interval, 2×interval, 4×interval, 8×interval, ...
    Exponential,
}

impl RetryStrategy {
    /// Stable string form used in storage and DTOs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Constant => "constant",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Exponential => "exponential",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Result<Self, RetryPolicyError> {
        match s {
            "constant" => Ok(RetryStrategy::Constant),
            "linear" => Ok(RetryStrategy::Linear),
            "exponential" => Ok(RetryStrategy::Exponential),
            _ => Err(RetryPolicyError::InvalidStrategy),
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy attached to a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    count: u32,
    interval: Duration,
}

impl RetryPolicy {
    /// Create a validated policy from its wire form.
    pub fn new(strategy: RetryStrategy, count: u32, interval: &str) -> Result<Self, RetryPolicyError> {
        if count == 0 {
            return Err(RetryPolicyError::InvalidCount);
        }

        if interval.trim().is_empty() {
            return Err(RetryPolicyError::MissingInterval);
        }

        let interval = parse_duration(interval)?;

        Ok(Self {
            strategy,
            count,
            interval,
        })
    }

    /// Get the spacing strategy.
    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    /// Get the maximum number of retries.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Get the base interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Get the interval in its stable string form (e.g. `15s`, `100ms`).
    pub fn interval_str(&self) -> String {
        format_duration(self.interval)
    }

    /// Compute the next retry time for the given 1-indexed attempt, or
    /// `None` once the attempt budget is exhausted.
    pub fn next_execution_time(
        &self,
        base: DateTime<Utc>,
        attempt: u32,
    ) -> Option<DateTime<Utc>> {
        if attempt == 0 || attempt > self.count {
            return None;
        }

        let step = match self.strategy {
            RetryStrategy::Constant => self.interval,
            RetryStrategy::Linear => self.interval.checked_mul(attempt)?,
            RetryStrategy::Exponential => self
                .interval
                .checked_mul(2u32.checked_pow(attempt - 1)?)?,
        };

        let delta = chrono::Duration::from_std(step).ok()?;
        base.checked_add_signed(delta)
    }
}

/// Parse a duration string like `100ms`, `15s`, `2m`, `1h30m`.
fn parse_duration(s: &str) -> Result<Duration, RetryPolicyError> {
    let s = s.trim();
    let mut total_ms: u64 = 0;
    let mut chars = s.chars().peekable();
    let mut parsed_any = false;

    while chars.peek().is_some() {
        let mut num = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                num.push(*c);
                chars.next();
            } else {
                break;
            }
        }

        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }

        let value: u64 = num.parse().map_err(|_| RetryPolicyError::InvalidInterval)?;
        let unit_ms = match unit.as_str() {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(RetryPolicyError::InvalidInterval),
        };

        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or(RetryPolicyError::InvalidInterval)?;
        parsed_any = true;
    }

    if !parsed_any || total_ms == 0 {
        return Err(RetryPolicyError::InvalidInterval);
    }

    Ok(Duration::from_millis(total_ms))
}

/// Format a duration back into the `1h30m`/`100ms` string form.
fn format_duration(d: Duration) -> String {
    let mut ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit_ms, suffix) in [
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
        (1, "ms"),
    ] {
        if ms >= unit_ms {
            out.push_str(&format!("{}{}", ms / unit_ms, suffix));
            ms %= unit_ms;
        }
    }

    out
}

/// Parse the stable `(strategy, count, interval)` triple loaded from storage.
pub fn parse_stored_policy(
    strategy: &str,
    count: i32,
    interval: &str,
) -> Result<RetryPolicy, RetryPolicyError> {
    let strategy = RetryStrategy::parse(strategy)?;
    let count = u32::try_from(count).map_err(|_| RetryPolicyError::InvalidCount)?;
    RetryPolicy::new(strategy, count, interval)
}
