use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The state a node sees when it runs: prior node outputs, workflow
/// variables, execution metadata, and its own input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionContext {
  pub execution_id: String,
  pub input: Value,
  pub node_outputs: Map<String, Value>,
  pub variables: Map<String, Value>,
  pub metadata: Map<String, Value>,
}

impl ExecutionContext {
  pub fn new(execution_id: impl Into<String>) -> Self {
    Self {
      execution_id: execution_id.into(),
      ..Default::default()
    }
  }

  /// Read a context from a saved JSON snapshot.
  ///
  /// Unknown keys are ignored and missing sections are empty, so a snapshot
  /// that is not an object yields an empty context for `execution_id`.
  pub fn from_snapshot(execution_id: &str, snapshot: &Value) -> Self {
    let mut ctx: Self = serde_json::from_value(snapshot.clone()).unwrap_or_default();
    if ctx.execution_id.is_empty() {
      ctx.execution_id = execution_id.to_string();
    }
    ctx
  }

  /// Lay `top` over this context. Entries in `top` win; a non-null input in
  /// `top` replaces this one.
  pub fn overlay(&mut self, top: &ExecutionContext) {
    extend(&mut self.node_outputs, &top.node_outputs);
    extend(&mut self.variables, &top.variables);
    extend(&mut self.metadata, &top.metadata);
    if !top.input.is_null() {
      self.input = top.input.clone();
    }
  }

  pub fn with_input(mut self, input: Value) -> Self {
    self.input = input;
    self
  }

  pub fn record_output(&mut self, node_id: &str, output: Value) {
    self.node_outputs.insert(node_id.to_string(), output);
  }
}

fn extend(base: &mut Map<String, Value>, top: &Map<String, Value>) {
  for (k, v) in top {
    base.insert(k.clone(), v.clone());
  }
}
