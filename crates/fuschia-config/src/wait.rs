use serde::{Deserialize, Serialize};

/// Per-source switches inside a wait block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSourceConfig {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub required: bool,
}

/// The `wait` block of a node that pauses until external signals arrive.
///
/// # Example
///
/// ```json
/// {
///   "apiCall": { "enabled": true, "required": true },
///   "messageEvent": { "enabled": true },
///   "aggregationStrategy": "REQUIRED_ONLY",
///   "timeoutSeconds": 600,
///   "onTimeout": "CONTINUE_WITH_PARTIAL"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitBlock {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub api_call: Option<EventSourceConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message_event: Option<EventSourceConfig>,
  /// Strategy name; `ALL`, `ANY`, `REQUIRED_ONLY` or `CUSTOM`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub aggregation_strategy: Option<String>,
  /// Event-kind names required by the `CUSTOM` strategy.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub required_events: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_seconds: Option<u64>,
  /// Timeout policy name; `FAIL`, `CONTINUE` or `CONTINUE_WITH_PARTIAL`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub on_timeout: Option<String>,
}
