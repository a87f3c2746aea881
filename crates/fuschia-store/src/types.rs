use chrono::{DateTime, Utc};
use fuschia_workflow::{AggregationStrategy, EventKind, OnTimeout, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use sqlx::types::Json;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Running,
  Succeeded,
  Failed,
}

/// Lifecycle of a wait state.
///
/// `Waiting` is the only state ingestion may write to. `Resuming` is held
/// while the engine is being asked to continue; the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "snake_case")]
pub enum WaitStatus {
  Waiting,
  Resuming,
  Completed,
  Timeout,
  Failed,
}

impl WaitStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Timeout | Self::Failed)
  }
}

/// What a retry schedule re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "snake_case")]
pub enum RetryType {
  NodeExecution,
  Execution,
}

/// Lifecycle of a retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "snake_case")]
pub enum RetryStatus {
  Pending,
  Scheduled,
  Retrying,
  Completed,
  Failed,
  Cancelled,
}

impl RetryStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
  }
}

/// A workflow execution as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
  pub execution_id: String,
  pub workflow_id: String,
  pub status: ExecutionStatus,
  pub trigger_data: Json<Value>,
  /// Output of each node that has completed, keyed by node id.
  pub node_outputs: Json<Map<String, Value>>,
  pub variables: Json<Map<String, Value>>,
  pub metadata: Json<Map<String, Value>>,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
  pub fn new(
    execution_id: impl Into<String>,
    workflow_id: impl Into<String>,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      execution_id: execution_id.into(),
      workflow_id: workflow_id.into(),
      status: ExecutionStatus::Running,
      trigger_data: Json(Value::Null),
      node_outputs: Json(Map::new()),
      variables: Json(Map::new()),
      metadata: Json(Map::new()),
      started_at: now,
      completed_at: None,
    }
  }
}

/// A node parked until external events arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WaitState {
  pub id: String,
  pub execution_id: String,
  pub node_id: String,
  /// Opaque token external systems echo back. Globally unique.
  pub correlation_id: String,
  pub aggregation_strategy: AggregationStrategy,
  pub enabled_events: Json<Vec<EventKind>>,
  pub required_events: Json<Vec<EventKind>>,
  pub on_timeout: OnTimeout,
  /// Event kinds received so far, in arrival order, without duplicates.
  pub received_events: Json<Vec<EventKind>>,
  pub api_response_data: Option<Json<Value>>,
  pub message_event_data: Option<Json<Value>>,
  pub status: WaitStatus,
  pub version: i64,
  pub resumed_at: Option<DateTime<Utc>>,
  pub resumed_by: Option<String>,
  pub failure: Option<String>,
  pub claimed_by: Option<String>,
  pub claimed_until: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl WaitState {
  pub fn has_received(&self, kind: EventKind) -> bool {
    self.received_events.0.contains(&kind)
  }

  pub fn is_enabled(&self, kind: EventKind) -> bool {
    self.enabled_events.0.contains(&kind)
  }

  /// Received kinds that this wait listens for, in arrival order.
  pub fn received_enabled(&self) -> Vec<EventKind> {
    self
      .received_events
      .0
      .iter()
      .copied()
      .filter(|k| self.is_enabled(*k))
      .collect()
  }

  pub fn payload(&self, kind: EventKind) -> Option<&Value> {
    match kind {
      EventKind::ApiResponse => self.api_response_data.as_ref().map(|j| &j.0),
      EventKind::MessageEvent => self.message_event_data.as_ref().map(|j| &j.0),
    }
  }

  /// Store the payload for `kind` and append it to the received set.
  pub fn record_event(&mut self, kind: EventKind, payload: Value) {
    match kind {
      EventKind::ApiResponse => self.api_response_data = Some(Json(payload)),
      EventKind::MessageEvent => self.message_event_data = Some(Json(payload)),
    }
    if !self.has_received(kind) {
      self.received_events.0.push(kind);
    }
  }

  /// Bump the version for a conditional write and return the version the
  /// write must be conditioned on.
  pub fn advance(&mut self, now: DateTime<Utc>) -> i64 {
    let expected = self.version;
    self.version += 1;
    self.updated_at = now;
    expected
  }
}

/// Saved inputs needed to re-run the retry target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryContext {
  Node {
    node_config: Value,
    input_data: Value,
    execution_context: Value,
  },
  Execution {
    trigger_data: Value,
  },
}

/// One failed attempt in a schedule's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptError {
  pub attempt: u32,
  pub timestamp: DateTime<Utc>,
  pub message: String,
  pub error_type: String,
}

/// A durable plan to re-run a failed node or execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RetrySchedule {
  pub id: String,
  pub retry_type: RetryType,
  /// Node id for node retries, execution id for execution retries.
  pub target_id: String,
  pub execution_id: String,
  pub node_id: Option<String>,
  pub policy: Json<RetryPolicy>,
  pub current_attempt: i64,
  pub scheduled_at: DateTime<Utc>,
  pub last_retried_at: Option<DateTime<Utc>>,
  pub status: RetryStatus,
  pub retry_context: Json<RetryContext>,
  pub error_history: Json<Vec<AttemptError>>,
  pub version: i64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl RetrySchedule {
  pub fn attempt(&self) -> u32 {
    u32::try_from(self.current_attempt).unwrap_or(0)
  }

  pub fn max_attempts(&self) -> u32 {
    self.policy.0.max_attempts
  }

  /// See [`WaitState::advance`].
  pub fn advance(&mut self, now: DateTime<Utc>) -> i64 {
    let expected = self.version;
    self.version += 1;
    self.updated_at = now;
    expected
  }
}
