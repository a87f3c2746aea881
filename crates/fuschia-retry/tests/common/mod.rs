#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fuschia_config::RetryBlock;
use fuschia_engine::{ChannelEngine, EngineCall, EngineError, ExecutionContext, NodeExecutor};
use fuschia_retry::{
  Cleanup, CleanupConfig, ContextCache, NodeSnapshot, RetryExecutor, RetryScheduler,
};
use fuschia_store::{
  ExecutionRecord, MemoryStore, RetryContext, RetrySchedule, RetryStatus, RetryType, Store,
};
use fuschia_workflow::RetryPolicy;
use serde_json::{Value, json};
use sqlx::types::Json;
use tokio::sync::mpsc;

pub const EXECUTION_ID: &str = "exec-1";

/// Fails each node a configured number of times, then succeeds with
/// `{"node": <id>, "call": <n>}`. Records every context it was given.
#[derive(Default)]
pub struct ScriptedNodes {
  failures: Mutex<HashMap<String, usize>>,
  delays: Mutex<HashMap<String, StdDuration>>,
  pub calls: Mutex<Vec<(String, ExecutionContext)>>,
}

impl ScriptedNodes {
  pub fn failing(node_id: &str, times: usize) -> Self {
    let nodes = Self::default();
    nodes.fail(node_id, times);
    nodes
  }

  pub fn fail(&self, node_id: &str, times: usize) {
    self
      .failures
      .lock()
      .unwrap()
      .insert(node_id.to_string(), times);
  }

  /// Every call to `node_id` takes at least `delay`.
  pub fn slow(&self, node_id: &str, delay: StdDuration) {
    self
      .delays
      .lock()
      .unwrap()
      .insert(node_id.to_string(), delay);
  }

  pub fn calls_for(&self, node_id: &str) -> Vec<ExecutionContext> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(id, _)| id == node_id)
      .map(|(_, ctx)| ctx.clone())
      .collect()
  }
}

#[async_trait]
impl NodeExecutor for ScriptedNodes {
  async fn execute(
    &self,
    node_id: &str,
    _node_config: &Value,
    context: &ExecutionContext,
  ) -> Result<Value, EngineError> {
    let delay = self.delays.lock().unwrap().get(node_id).copied();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    let call = {
      let mut calls = self.calls.lock().unwrap();
      calls.push((node_id.to_string(), context.clone()));
      calls.iter().filter(|(id, _)| id == node_id).count()
    };
    let mut failures = self.failures.lock().unwrap();
    if let Some(left) = failures.get_mut(node_id) {
      if *left > 0 {
        *left -= 1;
        return Err(EngineError::with_type(
          format!("{node_id} failed on call {call}"),
          "HttpError",
        ));
      }
    }
    Ok(json!({"node": node_id, "call": call}))
  }
}

pub struct Harness {
  pub store: Arc<MemoryStore>,
  pub nodes: Arc<ScriptedNodes>,
  pub cache: Arc<ContextCache>,
  pub scheduler: Arc<RetryScheduler>,
  pub engine: Arc<ChannelEngine>,
  pub calls: mpsc::UnboundedReceiver<EngineCall>,
}

impl Harness {
  pub async fn new(nodes: ScriptedNodes) -> Self {
    let store = Arc::new(MemoryStore::new());
    store.create_execution(&execution_record()).await.unwrap();
    Self::sharing(store, Arc::new(nodes))
  }

  pub fn sharing(store: Arc<MemoryStore>, nodes: Arc<ScriptedNodes>) -> Self {
    let (engine, calls) = ChannelEngine::pair();
    let engine = Arc::new(engine);
    let dyn_store: Arc<dyn Store> = store.clone();
    let cache = Arc::new(ContextCache::new());
    let executor = RetryExecutor::new(
      dyn_store.clone(),
      engine.clone(),
      nodes.clone(),
      cache.clone(),
    );
    let scheduler = Arc::new(RetryScheduler::new(dyn_store, engine.clone(), executor, 100));
    Self {
      store,
      nodes,
      cache,
      scheduler,
      engine,
      calls,
    }
  }

  pub fn cleanup(&self) -> Cleanup {
    Cleanup::new(
      self.store.clone(),
      self.engine.clone(),
      self.cache.clone(),
      CleanupConfig {
        interval: std::time::Duration::from_secs(86_400),
        terminal_retention: Duration::days(30),
        stale_after: Duration::days(30),
        batch_size: 100,
      },
    )
  }

  pub async fn retry_node(&self, node_id: &str, block: &RetryBlock) -> RetrySchedule {
    self
      .retry_node_in(node_id, block, json!({"variables": {"region": "eu"}}))
      .await
  }

  /// A node retry whose saved context is `execution_context`.
  pub async fn retry_node_in(
    &self,
    node_id: &str,
    block: &RetryBlock,
    execution_context: Value,
  ) -> RetrySchedule {
    self
      .scheduler
      .create_for_node(
        EXECUTION_ID,
        node_id,
        &format!("{node_id}-run-1"),
        block,
        NodeSnapshot {
          node_config: json!({"url": "https://example.test"}),
          input_data: json!({"attempted": true}),
          execution_context,
        },
      )
      .await
      .unwrap()
  }

  pub async fn reload(&self, schedule: &RetrySchedule) -> RetrySchedule {
    self
      .store
      .get_retry_schedule(&schedule.id)
      .await
      .unwrap()
      .unwrap()
  }

  pub fn drain(&mut self) -> Vec<EngineCall> {
    let mut calls = Vec::new();
    while let Ok(call) = self.calls.try_recv() {
      calls.push(call);
    }
    calls
  }
}

/// The execution every harness starts with: one prior output and a
/// variable the retry snapshot overrides.
pub fn execution_record() -> ExecutionRecord {
  let mut record = ExecutionRecord::new(EXECUTION_ID, "wf-1", Utc::now());
  record.node_outputs.0.insert("fetch".into(), json!({"rows": 3}));
  record.variables.0.insert("region".into(), json!("us"));
  record.variables.0.insert("tier".into(), json!("gold"));
  record
}

pub fn block(strategy: &str, max_attempts: u32) -> RetryBlock {
  RetryBlock {
    strategy: Some(strategy.to_string()),
    max_attempts: Some(max_attempts),
    ..Default::default()
  }
}

/// A node schedule written straight to the store.
pub fn raw_schedule(
  execution_id: &str,
  status: RetryStatus,
  current_attempt: i64,
  scheduled_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
) -> RetrySchedule {
  RetrySchedule {
    id: uuid::Uuid::new_v4().to_string(),
    retry_type: RetryType::NodeExecution,
    target_id: "send-run-1".to_string(),
    execution_id: execution_id.to_string(),
    node_id: Some("send".to_string()),
    policy: Json(RetryPolicy::default()),
    current_attempt,
    scheduled_at,
    last_retried_at: None,
    status,
    retry_context: Json(RetryContext::Node {
      node_config: json!({}),
      input_data: Value::Null,
      execution_context: json!({}),
    }),
    error_history: Json(Vec::new()),
    version: 1,
    created_at: scheduled_at,
    updated_at,
  }
}
