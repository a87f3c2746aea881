//! Fuschia Engine seams
//!
//! The wait and retry services never run workflow steps themselves. They ask
//! an [`Engine`] to resume a parked node, restart an execution, or record a
//! failure, and a [`NodeExecutor`] to re-run a single node.
//!
//! ```text
//! ┌──────────────────────┐   resume_execution    ┌──────────────┐
//! │  Resume Coordinator  │ ────────────────────▶ │              │
//! │  Timeout Sweeper     │   report_failure      │    Engine    │
//! └──────────────────────┘ ────────────────────▶ │              │
//! ┌──────────────────────┐   restart_execution   │              │
//! │    Retry Executor    │ ────────────────────▶ └──────────────┘
//! │                      │   execute             ┌──────────────┐
//! │                      │ ────────────────────▶ │ NodeExecutor │
//! └──────────────────────┘                       └──────────────┘
//! ```

mod channel;
mod context;
mod error;

pub use channel::{ChannelEngine, EngineCall};
pub use context::ExecutionContext;
pub use error::EngineError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A failure the engine should record against an execution or node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
  pub execution_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node_id: Option<String>,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_type: Option<String>,
  /// How long the node had been waiting, for timeouts.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub elapsed_ms: Option<i64>,
}

impl FailureReport {
  pub fn new(execution_id: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      execution_id: execution_id.into(),
      node_id: None,
      message: message.into(),
      error_type: None,
      elapsed_ms: None,
    }
  }

  pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
    self.node_id = Some(node_id.into());
    self
  }

  pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
    self.error_type = Some(error_type.into());
    self
  }

  pub fn with_elapsed_ms(mut self, elapsed_ms: i64) -> Self {
    self.elapsed_ms = Some(elapsed_ms);
    self
  }
}

/// The workflow engine, as seen from the coordination services.
#[async_trait]
pub trait Engine: Send + Sync {
  /// Continue a parked node with the aggregated event payload.
  ///
  /// Called at most once per wait state.
  async fn resume_execution(
    &self,
    execution_id: &str,
    node_id: &str,
    payload: Value,
  ) -> Result<(), EngineError>;

  /// Record a node or execution failure.
  async fn report_failure(&self, report: FailureReport) -> Result<(), EngineError>;

  /// Run an execution again from its trigger data and return its output.
  async fn restart_execution(
    &self,
    execution_id: &str,
    trigger_data: Value,
  ) -> Result<Value, EngineError>;
}

/// Runs a single node outside the normal graph traversal.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
  async fn execute(
    &self,
    node_id: &str,
    node_config: &Value,
    context: &ExecutionContext,
  ) -> Result<Value, EngineError>;
}
