//! An [`Engine`] that forwards every call onto a channel.
//!
//! Useful when the real engine lives elsewhere in the process, or when the
//! caller only wants to observe what the coordination services asked for.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Engine, EngineError, ExecutionContext, FailureReport, NodeExecutor};

/// A call made into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum EngineCall {
  Resume {
    execution_id: String,
    node_id: String,
    payload: Value,
  },
  ReportFailure(FailureReport),
  Restart {
    execution_id: String,
    trigger_data: Value,
  },
  ExecuteNode {
    node_id: String,
    node_config: Value,
    context: ExecutionContext,
  },
}

#[derive(Debug, Clone)]
pub struct ChannelEngine {
  // Unbounded so a slow consumer never stalls a sweep or dispatch.
  sender: mpsc::UnboundedSender<EngineCall>,
}

impl ChannelEngine {
  pub fn new(sender: mpsc::UnboundedSender<EngineCall>) -> Self {
    Self { sender }
  }

  /// A new engine together with the receiving end of its channel.
  pub fn pair() -> (Self, mpsc::UnboundedReceiver<EngineCall>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }

  fn forward(&self, call: EngineCall) -> Result<(), EngineError> {
    debug!(?call, "engine_call_forwarded");
    self
      .sender
      .send(call)
      .map_err(|_| EngineError::Unavailable("engine channel closed".to_string()))
  }
}

#[async_trait]
impl Engine for ChannelEngine {
  async fn resume_execution(
    &self,
    execution_id: &str,
    node_id: &str,
    payload: Value,
  ) -> Result<(), EngineError> {
    self.forward(EngineCall::Resume {
      execution_id: execution_id.to_string(),
      node_id: node_id.to_string(),
      payload,
    })
  }

  async fn report_failure(&self, report: FailureReport) -> Result<(), EngineError> {
    self.forward(EngineCall::ReportFailure(report))
  }

  async fn restart_execution(
    &self,
    execution_id: &str,
    trigger_data: Value,
  ) -> Result<Value, EngineError> {
    self.forward(EngineCall::Restart {
      execution_id: execution_id.to_string(),
      trigger_data,
    })?;
    Ok(Value::Null)
  }
}

#[async_trait]
impl NodeExecutor for ChannelEngine {
  async fn execute(
    &self,
    node_id: &str,
    node_config: &Value,
    context: &ExecutionContext,
  ) -> Result<Value, EngineError> {
    self.forward(EngineCall::ExecuteNode {
      node_id: node_id.to_string(),
      node_config: node_config.clone(),
      context: context.clone(),
    })?;
    Ok(Value::Null)
  }
}
