use serde::{Deserialize, Serialize};

/// One row of a custom retry table. The components are summed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomDelay {
  pub attempt: u32,
  #[serde(default)]
  pub days: i64,
  #[serde(default)]
  pub hours: i64,
  #[serde(default)]
  pub seconds: i64,
}

/// The `retry` block of a node or execution.
///
/// Only the fields relevant to `strategy` are read during resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBlock {
  /// Strategy name; `IMMEDIATE`, `FIXED_DELAY`, `EXPONENTIAL_BACKOFF` or `CUSTOM`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub strategy: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_attempts: Option<u32>,

  // FIXED_DELAY
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub delay_seconds: Option<u64>,

  // EXPONENTIAL_BACKOFF
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub initial_delay_seconds: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub multiplier: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_delay_seconds: Option<u64>,

  // CUSTOM
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub custom_delays: Vec<CustomDelay>,
}
