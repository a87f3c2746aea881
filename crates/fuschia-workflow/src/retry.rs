use fuschia_config::{CustomDelay, RetryBlock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PolicyError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_FIXED_DELAY_SECS: u64 = 300;

pub const DEFAULT_EXPONENTIAL_INITIAL_DELAY_SECS: u64 = 60;

/// Default exponential multiplier when not specified
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

/// How the next retry instant is derived from the attempt number.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(
  tag = "strategy",
  rename_all = "SCREAMING_SNAKE_CASE",
  rename_all_fields = "camelCase"
)]
pub enum Backoff {
  /// Retry as soon as the dispatcher next runs.
  #[default]
  Immediate,
  /// Constant delay between attempts.
  FixedDelay { delay_seconds: u64 },
  /// delay = initial_delay * multiplier^attempt, optionally capped.
  ExponentialBackoff {
    initial_delay_seconds: u64,
    multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_delay_seconds: Option<u64>,
  },
  /// Per-attempt delay table.
  Custom { delays: Vec<CustomDelay> },
}

impl Backoff {
  pub fn kind_str(&self) -> &'static str {
    match self {
      Backoff::Immediate => "IMMEDIATE",
      Backoff::FixedDelay { .. } => "FIXED_DELAY",
      Backoff::ExponentialBackoff { .. } => "EXPONENTIAL_BACKOFF",
      Backoff::Custom { .. } => "CUSTOM",
    }
  }
}

/// A resolved retry block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub backoff: Backoff,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      backoff: Backoff::Immediate,
    }
  }
}

impl RetryPolicy {
  /// Resolve a raw retry block, applying strategy-specific defaults.
  pub fn resolve(block: &RetryBlock) -> Self {
    let max_attempts = match block.max_attempts {
      None => DEFAULT_MAX_ATTEMPTS,
      Some(0) => {
        warn!(
          default = DEFAULT_MAX_ATTEMPTS,
          "maxAttempts must be positive, using default"
        );
        DEFAULT_MAX_ATTEMPTS
      }
      Some(n) => n,
    };

    let name = block.strategy.as_deref().unwrap_or("IMMEDIATE");
    let backoff = match name.trim().to_ascii_uppercase().as_str() {
      "IMMEDIATE" => Backoff::Immediate,
      "FIXED_DELAY" => Backoff::FixedDelay {
        delay_seconds: block.delay_seconds.unwrap_or(DEFAULT_FIXED_DELAY_SECS),
      },
      "EXPONENTIAL_BACKOFF" => Backoff::ExponentialBackoff {
        initial_delay_seconds: block
          .initial_delay_seconds
          .unwrap_or(DEFAULT_EXPONENTIAL_INITIAL_DELAY_SECS),
        multiplier: match block.multiplier {
          Some(m) if m > 0.0 => m,
          _ => DEFAULT_EXPONENTIAL_MULTIPLIER,
        },
        max_delay_seconds: block.max_delay_seconds,
      },
      "CUSTOM" => {
        if block.custom_delays.is_empty() {
          warn!("CUSTOM retry strategy has an empty delay table");
        }
        Backoff::Custom {
          delays: block.custom_delays.clone(),
        }
      }
      _ => {
        let e = PolicyError::UnknownRetryStrategy(name.to_string());
        warn!(error = %e, "falling back to IMMEDIATE retry");
        Backoff::Immediate
      }
    };

    Self {
      max_attempts,
      backoff,
    }
  }
}
