//! Backoff calculators.
//!
//! Pure functions from a policy and an attempt number to the delay before
//! the next try. `attempt` is the schedule's `current_attempt`: 0 when the
//! schedule is created, then the number of attempts already made.

use chrono::{DateTime, Duration, Utc};
use fuschia_config::CustomDelay;
use fuschia_workflow::Backoff;

/// Upper bound on any single delay. Larger values are clamped.
pub const MAX_DELAY: Duration = Duration::days(365);

/// Used by `Custom` when the table is empty.
pub const DEFAULT_CUSTOM_DELAY: Duration = Duration::days(1);

/// Delay before the try that follows `attempt`.
pub fn delay_for(backoff: &Backoff, attempt: u32) -> Duration {
  let delay = match backoff {
    Backoff::Immediate => Duration::zero(),
    Backoff::FixedDelay { delay_seconds } => seconds(*delay_seconds as f64),
    Backoff::ExponentialBackoff {
      initial_delay_seconds,
      multiplier,
      max_delay_seconds,
    } => {
      let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
      let mut secs = *initial_delay_seconds as f64 * multiplier.powi(exponent);
      if let Some(cap) = max_delay_seconds {
        secs = secs.min(*cap as f64);
      }
      seconds(secs)
    }
    Backoff::Custom { delays } => custom_delay(delays, attempt),
  };
  delay.clamp(Duration::zero(), MAX_DELAY)
}

/// `now` plus [`delay_for`].
pub fn next_retry_at(backoff: &Backoff, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
  now
    .checked_add_signed(delay_for(backoff, attempt))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// An exact table entry contributes all of its components. Without one the
/// last entry's `days` alone is used.
fn custom_delay(delays: &[CustomDelay], attempt: u32) -> Duration {
  if let Some(entry) = delays.iter().find(|d| d.attempt == attempt) {
    return days(entry.days) + hours(entry.hours) + seconds(entry.seconds as f64);
  }
  match delays.last() {
    Some(last) => days(last.days),
    None => DEFAULT_CUSTOM_DELAY,
  }
}

fn seconds(secs: f64) -> Duration {
  if !secs.is_finite() || secs >= MAX_DELAY.num_seconds() as f64 {
    return MAX_DELAY;
  }
  if secs <= 0.0 {
    return Duration::zero();
  }
  Duration::milliseconds((secs * 1000.0).round() as i64)
}

fn days(n: i64) -> Duration {
  Duration::try_days(n).unwrap_or(MAX_DELAY)
}

fn hours(n: i64) -> Duration {
  Duration::try_hours(n).unwrap_or(MAX_DELAY)
}
