//! Injectable time source.
//!
//! Every timestamp the scheduler produces flows through a [`Clock`] so tests
//! can pin time. All produced instants are rounded down to whole seconds.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::sync::Arc;

/// Shared time source. Production passes the wall clock, tests pass a fixed
/// or stepping closure.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall-clock time source.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// A clock that always returns the given instant.
pub fn fixed_clock(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}

/// Round an instant down to whole seconds.
pub fn round_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(TimeDelta::seconds(1))
        .unwrap_or_else(|_| t.with_timezone(&Utc))
}

/// Read the clock and round to whole seconds.
pub fn now_rounded(clock: &Clock) -> DateTime<Utc> {
    round_to_seconds(clock())
}
