use serde::{Deserialize, Serialize};

/// Dot-paths tried, in order, when extracting ids from a message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePaths {
  #[serde(default = "default_execution_id_paths")]
  pub execution_id: Vec<String>,
  #[serde(default = "default_correlation_id_paths")]
  pub correlation_id: Vec<String>,
}

impl Default for MessagePaths {
  fn default() -> Self {
    Self {
      execution_id: default_execution_id_paths(),
      correlation_id: default_correlation_id_paths(),
    }
  }
}

fn default_execution_id_paths() -> Vec<String> {
  ["execution_id", "executionId", "data.execution_id", "data.executionId"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_correlation_id_paths() -> Vec<String> {
  [
    "correlation_id",
    "correlationId",
    "data.correlation_id",
    "data.correlationId",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

/// Settings for one coordinator instance.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
  /// Identity recorded as `resumed_by` and used for sweep claims.
  /// Generated at startup when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub instance_id: Option<String>,

  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,
  #[serde(default = "default_batch_size")]
  pub sweep_batch_size: u32,
  #[serde(default = "default_claim_ttl_secs")]
  pub claim_ttl_secs: u64,

  #[serde(default = "default_dispatch_interval_secs")]
  pub dispatch_interval_secs: u64,
  #[serde(default = "default_batch_size")]
  pub dispatch_batch_size: u32,

  #[serde(default = "default_cleanup_interval_secs")]
  pub cleanup_interval_secs: u64,
  #[serde(default = "default_retention_days")]
  pub terminal_retention_days: u32,
  #[serde(default = "default_retention_days")]
  pub stale_after_days: u32,

  #[serde(default = "default_ingest_cas_retries")]
  pub ingest_cas_retries: u32,
  #[serde(default)]
  pub message_paths: MessagePaths,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      instance_id: None,
      sweep_interval_secs: default_sweep_interval_secs(),
      sweep_batch_size: default_batch_size(),
      claim_ttl_secs: default_claim_ttl_secs(),
      dispatch_interval_secs: default_dispatch_interval_secs(),
      dispatch_batch_size: default_batch_size(),
      cleanup_interval_secs: default_cleanup_interval_secs(),
      terminal_retention_days: default_retention_days(),
      stale_after_days: default_retention_days(),
      ingest_cas_retries: default_ingest_cas_retries(),
      message_paths: MessagePaths::default(),
    }
  }
}

fn default_sweep_interval_secs() -> u64 {
  60
}

fn default_dispatch_interval_secs() -> u64 {
  60
}

fn default_claim_ttl_secs() -> u64 {
  120
}

fn default_cleanup_interval_secs() -> u64 {
  24 * 60 * 60
}

fn default_batch_size() -> u32 {
  100
}

fn default_retention_days() -> u32 {
  30
}

fn default_ingest_cas_retries() -> u32 {
  5
}
