use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fuschia_config::WaitBlock;
use fuschia_store::{Error as StoreError, Store, WaitState, WaitStatus};
use fuschia_workflow::WaitPolicy;
use sqlx::types::Json;
use tracing::{info, instrument};

use crate::error::AwaitError;

/// Creates wait states for nodes that park on external events.
#[derive(Clone)]
pub struct WaitRegistry {
  store: Arc<dyn Store>,
}

impl WaitRegistry {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }

  /// Resolve `block` and register a wait for `node_id`.
  pub async fn register(
    &self,
    execution_id: &str,
    node_id: &str,
    block: &WaitBlock,
  ) -> Result<WaitState, AwaitError> {
    let policy = WaitPolicy::resolve(block);
    self
      .register_policy(execution_id, node_id, &policy, Utc::now())
      .await
  }

  /// Register a wait for an already-resolved policy.
  ///
  /// The execution must exist. The new state is `Waiting` with a fresh
  /// correlation id and expires `timeout_seconds` after `now`.
  #[instrument(skip(self, policy), fields(strategy = ?policy.strategy))]
  pub async fn register_policy(
    &self,
    execution_id: &str,
    node_id: &str,
    policy: &WaitPolicy,
    now: DateTime<Utc>,
  ) -> Result<WaitState, AwaitError> {
    match self.store.get_execution(execution_id).await {
      Ok(_) => {}
      Err(StoreError::NotFound(_)) => {
        return Err(AwaitError::ExecutionNotFound(execution_id.to_string()));
      }
      Err(e) => return Err(e.into()),
    }

    let timeout = i64::try_from(policy.timeout_seconds).unwrap_or(i64::MAX);
    let expires_at = now
      .checked_add_signed(Duration::try_seconds(timeout).unwrap_or(Duration::MAX))
      .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let state = WaitState {
      id: uuid::Uuid::new_v4().to_string(),
      execution_id: execution_id.to_string(),
      node_id: node_id.to_string(),
      correlation_id: uuid::Uuid::new_v4().to_string(),
      aggregation_strategy: policy.strategy,
      enabled_events: Json(policy.enabled_events.clone()),
      required_events: Json(policy.required_events.clone()),
      on_timeout: policy.on_timeout,
      received_events: Json(Vec::new()),
      api_response_data: None,
      message_event_data: None,
      status: WaitStatus::Waiting,
      version: 1,
      resumed_at: None,
      resumed_by: None,
      failure: None,
      claimed_by: None,
      claimed_until: None,
      created_at: now,
      updated_at: now,
      expires_at,
    };

    match self.store.insert_wait_state(&state).await {
      Ok(()) => {}
      Err(StoreError::Conflict(_)) => {
        return Err(AwaitError::AlreadyWaiting {
          execution_id: execution_id.to_string(),
          node_id: node_id.to_string(),
        });
      }
      Err(e) => return Err(e.into()),
    }

    info!(
      execution_id,
      node_id,
      correlation_id = %state.correlation_id,
      expires_at = %state.expires_at,
      "wait_state_registered"
    );
    Ok(state)
  }
}
