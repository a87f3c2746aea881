//! Replays one retry target.

use std::sync::Arc;

use fuschia_engine::{Engine, EngineError, ExecutionContext, NodeExecutor};
use fuschia_store::{RetryContext, RetrySchedule, RetryType, Store};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, instrument};

use crate::cache::ContextCache;

pub const CONTEXT_UNAVAILABLE: &str = "ContextUnavailable";

/// What one replay produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptResult {
  Succeeded { output: Value },
  Failed { message: String, error_type: String },
}

impl AttemptResult {
  fn failed(message: impl Into<String>, error_type: impl Into<String>) -> Self {
    Self::Failed {
      message: message.into(),
      error_type: error_type.into(),
    }
  }
}

impl From<EngineError> for AttemptResult {
  fn from(e: EngineError) -> Self {
    Self::failed(e.to_string(), e.error_type())
  }
}

/// Re-runs a node or a whole execution from a schedule's saved context.
///
/// Never decides whether a schedule is exhausted; it only reports what the
/// replay did.
pub struct RetryExecutor {
  store: Arc<dyn Store>,
  engine: Arc<dyn Engine>,
  nodes: Arc<dyn NodeExecutor>,
  cache: Arc<ContextCache>,
}

impl RetryExecutor {
  pub fn new(
    store: Arc<dyn Store>,
    engine: Arc<dyn Engine>,
    nodes: Arc<dyn NodeExecutor>,
    cache: Arc<ContextCache>,
  ) -> Self {
    Self {
      store,
      engine,
      nodes,
      cache,
    }
  }

  pub fn cache(&self) -> &Arc<ContextCache> {
    &self.cache
  }

  #[instrument(skip_all, fields(schedule_id = %schedule.id, execution_id = %schedule.execution_id))]
  pub async fn run(&self, schedule: &RetrySchedule) -> AttemptResult {
    match (&schedule.retry_type, &schedule.retry_context.0) {
      (
        RetryType::NodeExecution,
        RetryContext::Node {
          node_config,
          input_data,
          execution_context,
        },
      ) => {
        let node_id = schedule.node_id.as_deref().unwrap_or(&schedule.target_id);
        self
          .run_node(
            &schedule.id,
            &schedule.execution_id,
            node_id,
            node_config,
            input_data,
            execution_context,
          )
          .await
      }
      (RetryType::Execution, RetryContext::Execution { trigger_data }) => {
        self
          .run_execution(&schedule.execution_id, trigger_data)
          .await
      }
      (retry_type, _) => AttemptResult::failed(
        format!("retry context does not match retry type {retry_type:?}"),
        "InvalidRetryContext",
      ),
    }
  }

  async fn run_node(
    &self,
    schedule_id: &str,
    execution_id: &str,
    node_id: &str,
    node_config: &Value,
    input_data: &Value,
    snapshot: &Value,
  ) -> AttemptResult {
    let context = match self.context_for(schedule_id, execution_id, snapshot).await {
      Ok(ctx) => ctx.with_input(input_data.clone()),
      Err(message) => {
        error!(node_id, error = %message, "retry_context_unavailable");
        return AttemptResult::failed(message, CONTEXT_UNAVAILABLE);
      }
    };

    let output = match self.nodes.execute(node_id, node_config, &context).await {
      Ok(output) => output,
      Err(e) => return e.into(),
    };

    if let Err(e) = self
      .store
      .save_node_output(execution_id, node_id, &output)
      .await
    {
      error!(node_id, error = %e, "retry_output_not_persisted");
    }
    self.cache.record_output(execution_id, node_id, output.clone());
    AttemptResult::Succeeded { output }
  }

  async fn run_execution(&self, execution_id: &str, trigger_data: &Value) -> AttemptResult {
    match self
      .engine
      .restart_execution(execution_id, trigger_data.clone())
      .await
    {
      Ok(output) => {
        // The restarted run produced a new context.
        self.cache.remove_execution(execution_id);
        AttemptResult::Succeeded { output }
      }
      Err(e) => e.into(),
    }
  }

  /// The schedule's cached context, or one rebuilt from the execution record
  /// with the schedule's own snapshot laid over it.
  async fn context_for(
    &self,
    schedule_id: &str,
    execution_id: &str,
    snapshot: &Value,
  ) -> Result<ExecutionContext, String> {
    if let Some(ctx) = self.cache.get(schedule_id) {
      debug!("retry_context_cache_hit");
      return Ok(ctx);
    }

    let record = self
      .store
      .get_execution(execution_id)
      .await
      .map_err(|e| format!("failed to load execution {execution_id}: {e}"))?;

    let mut ctx = ExecutionContext::new(execution_id);
    ctx.node_outputs = record.node_outputs.0;
    ctx.variables = record.variables.0;
    ctx.metadata = record.metadata.0;
    ctx.overlay(&ExecutionContext::from_snapshot(execution_id, snapshot));

    self.cache.insert(schedule_id, ctx.clone());
    Ok(ctx)
  }
}
