#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fuschia_await::{
  EventRouter, ResumeCoordinator, SweeperConfig, TimeoutSweeper, WaitRegistry,
};
use fuschia_config::{EventSourceConfig, MessagePaths, WaitBlock};
use fuschia_engine::{ChannelEngine, Engine, EngineCall, EngineError, FailureReport};
use fuschia_store::{ExecutionRecord, MemoryStore, Store, WaitState};
use serde_json::Value;
use tokio::sync::mpsc;

pub const EXECUTION_ID: &str = "exec-1";
pub const NODE_ID: &str = "approve";

/// Rejects every resume; forwards failure reports to a channel.
pub struct RejectingEngine {
  pub reports: mpsc::UnboundedSender<FailureReport>,
}

#[async_trait]
impl Engine for RejectingEngine {
  async fn resume_execution(&self, _: &str, _: &str, _: Value) -> Result<(), EngineError> {
    Err(EngineError::execution("node crashed on resume"))
  }

  async fn report_failure(&self, report: FailureReport) -> Result<(), EngineError> {
    let _ = self.reports.send(report);
    Ok(())
  }

  async fn restart_execution(&self, _: &str, _: Value) -> Result<Value, EngineError> {
    Ok(Value::Null)
  }
}

pub struct Harness {
  pub store: Arc<MemoryStore>,
  pub registry: WaitRegistry,
  pub coordinator: Arc<ResumeCoordinator>,
  pub router: Arc<EventRouter>,
  pub sweeper: TimeoutSweeper,
}

impl Harness {
  pub async fn new(engine: Arc<dyn Engine>) -> Self {
    Self::with_instance(engine, "instance-a").await
  }

  pub async fn with_instance(engine: Arc<dyn Engine>, instance_id: &str) -> Self {
    let store = Arc::new(MemoryStore::new());
    store
      .create_execution(&ExecutionRecord::new(EXECUTION_ID, "wf-1", Utc::now()))
      .await
      .unwrap();
    Self::sharing(store, engine, instance_id)
  }

  /// Another coordinator instance over the same store.
  pub fn sharing(store: Arc<MemoryStore>, engine: Arc<dyn Engine>, instance_id: &str) -> Self {
    let dyn_store: Arc<dyn Store> = store.clone();
    let coordinator = Arc::new(ResumeCoordinator::new(
      dyn_store.clone(),
      engine.clone(),
      instance_id,
    ));
    let router = Arc::new(EventRouter::new(
      dyn_store.clone(),
      coordinator.clone(),
      MessagePaths::default(),
      5,
    ));
    let sweeper = TimeoutSweeper::new(
      dyn_store.clone(),
      engine,
      coordinator.clone(),
      SweeperConfig {
        interval: std::time::Duration::from_secs(60),
        batch_size: 100,
        claim_ttl: Duration::seconds(120),
      },
    );
    Self {
      store,
      registry: WaitRegistry::new(dyn_store),
      coordinator,
      router,
      sweeper,
    }
  }

  pub async fn register(&self, block: &WaitBlock) -> WaitState {
    self
      .registry
      .register(EXECUTION_ID, NODE_ID, block)
      .await
      .unwrap()
  }

  pub async fn reload(&self, state: &WaitState) -> WaitState {
    self.store.get_wait_state(&state.id).await.unwrap().unwrap()
  }
}

pub fn channel_engine() -> (Arc<dyn Engine>, mpsc::UnboundedReceiver<EngineCall>) {
  let (engine, rx) = ChannelEngine::pair();
  (Arc::new(engine), rx)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<EngineCall>) -> Vec<EngineCall> {
  let mut calls = Vec::new();
  while let Ok(call) = rx.try_recv() {
    calls.push(call);
  }
  calls
}

pub fn wait_block(strategy: &str, on_timeout: &str) -> WaitBlock {
  let enabled = Some(EventSourceConfig {
    enabled: true,
    required: true,
  });
  WaitBlock {
    api_call: enabled.clone(),
    message_event: enabled,
    aggregation_strategy: Some(strategy.to_string()),
    on_timeout: Some(on_timeout.to_string()),
    timeout_seconds: Some(300),
    ..Default::default()
  }
}

/// Listens for api responses only.
pub fn api_only_block(strategy: &str, on_timeout: &str) -> WaitBlock {
  WaitBlock {
    message_event: None,
    ..wait_block(strategy, on_timeout)
  }
}
