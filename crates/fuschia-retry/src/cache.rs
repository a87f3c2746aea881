use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use fuschia_engine::ExecutionContext;
use serde_json::Value;

/// Rebuilt retry contexts, keyed by schedule id.
///
/// Each schedule keeps the context built from its own snapshot between
/// attempts. Outputs are fanned out to every cached schedule of the same
/// execution so a node retried after another sees its sibling's fresh output
/// without a store round trip.
#[derive(Debug, Default)]
pub struct ContextCache {
  contexts: RwLock<HashMap<String, ExecutionContext>>,
}

impl ContextCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, schedule_id: &str) -> Option<ExecutionContext> {
    self
      .contexts
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(schedule_id)
      .cloned()
  }

  pub fn insert(&self, schedule_id: impl Into<String>, context: ExecutionContext) {
    self
      .contexts
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(schedule_id.into(), context);
  }

  /// Record `output` for `node_id` in every cached context of the execution.
  pub fn record_output(&self, execution_id: &str, node_id: &str, output: Value) {
    let mut contexts = self
      .contexts
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    for ctx in contexts.values_mut() {
      if ctx.execution_id == execution_id {
        ctx.record_output(node_id, output.clone());
      }
    }
  }

  pub fn remove(&self, schedule_id: &str) -> Option<ExecutionContext> {
    self
      .contexts
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(schedule_id)
  }

  /// Drop every cached context of the execution.
  pub fn remove_execution(&self, execution_id: &str) {
    self
      .contexts
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .retain(|_, ctx| ctx.execution_id != execution_id);
  }

  pub fn len(&self) -> usize {
    self
      .contexts
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn context(execution_id: &str, region: &str) -> ExecutionContext {
    let mut ctx = ExecutionContext::new(execution_id);
    ctx.variables.insert("region".into(), json!(region));
    ctx
  }

  #[test]
  fn test_schedules_keep_their_own_context() {
    let cache = ContextCache::new();
    cache.insert("s-1", context("exec-1", "eu"));
    cache.insert("s-2", context("exec-1", "apac"));

    assert_eq!(cache.get("s-1").unwrap().variables["region"], json!("eu"));
    assert_eq!(cache.get("s-2").unwrap().variables["region"], json!("apac"));
    assert!(cache.get("s-3").is_none());
  }

  #[test]
  fn test_record_output_reaches_siblings_only() {
    let cache = ContextCache::new();
    cache.record_output("exec-1", "fetch", json!(1));
    assert!(cache.is_empty());

    cache.insert("s-1", context("exec-1", "eu"));
    cache.insert("s-2", context("exec-1", "apac"));
    cache.insert("s-3", context("exec-2", "us"));
    cache.record_output("exec-1", "fetch", json!({"rows": 3}));

    assert_eq!(cache.get("s-1").unwrap().node_outputs["fetch"], json!({"rows": 3}));
    assert_eq!(cache.get("s-2").unwrap().node_outputs["fetch"], json!({"rows": 3}));
    assert!(cache.get("s-3").unwrap().node_outputs.is_empty());
  }

  #[test]
  fn test_remove_and_remove_execution() {
    let cache = ContextCache::new();
    cache.insert("s-1", context("exec-1", "eu"));
    cache.insert("s-2", context("exec-1", "apac"));
    cache.insert("s-3", context("exec-2", "us"));

    assert!(cache.remove("s-1").is_some());
    assert!(cache.remove("s-1").is_none());
    cache.remove_execution("exec-1");
    assert_eq!(cache.len(), 1);
    assert!(cache.get("s-3").is_some());
  }
}
