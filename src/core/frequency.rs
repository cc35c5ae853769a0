//! Frequency parsing and next occurrence calculation.
//!
//! A frequency is either the literal `once` (fire a single time, then
//! finish) or a six-field cron expression with a seconds field:
//! `second minute hour day-of-month month day-of-week`.

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use thiserror::Error;

use super::clock::round_to_seconds;

/// The literal frequency for one-shot schedules.
pub const ONCE: &str = "once";

/// Errors that can occur when parsing a frequency.
#[derive(Debug, Error)]
pub enum FrequencyError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

/// Parsed schedule frequency.
///
/// Parsed once at schedule creation (or storage load) and kept on the
/// entity; [`Frequency::next_after`] is re-evaluated on each advance.
/// Persisted schedules are assumed to parse, the admin validator rejects
/// bad expressions before anything reaches storage.
#[derive(Debug, Clone)]
pub struct Frequency {
    /// The original expression string.
    expression: String,
    /// Parsed frequency kind.
    kind: FrequencyKind,
}

#[derive(Debug, Clone)]
enum FrequencyKind {
    /// Fire once, then finish.
    Once,
    /// Recurring cron schedule.
    Cron(Box<CronSchedule>),
}

impl Frequency {
    /// Parse a frequency expression.
    pub fn parse(expression: impl Into<String>) -> Result<Self, FrequencyError> {
        let expression = expression.into();
        let trimmed = expression.trim();

        if trimmed == ONCE {
            return Ok(Self {
                expression,
                kind: FrequencyKind::Once,
            });
        }

        let fields = trimmed.split_whitespace().count();
        if fields != 6 {
            return Err(FrequencyError::InvalidCron(format!(
                "expected 6 fields, got {}",
                fields
            )));
        }

        let schedule = CronSchedule::from_str(trimmed)
            .map_err(|e| FrequencyError::InvalidCron(e.to_string()))?;

        Ok(Self {
            expression,
            kind: FrequencyKind::Cron(Box::new(schedule)),
        })
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether this is a one-shot frequency.
    pub fn is_once(&self) -> bool {
        matches!(self.kind, FrequencyKind::Once)
    }

    /// Get the first occurrence strictly after the given time, rounded down
    /// to whole seconds. `None` for one-shot frequencies and exhausted cron
    /// schedules.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            FrequencyKind::Once => None,
            FrequencyKind::Cron(schedule) => {
                schedule.after(&after).next().map(round_to_seconds)
            }
        }
    }
}
