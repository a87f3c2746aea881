//! Fuschia Store
//!
//! Durable state for the coordination services: workflow executions, wait
//! states, and retry schedules.
//!
//! Every write to a wait state or retry schedule after creation goes through a
//! version-checked conditional update ([`Store::cas_wait_state`],
//! [`Store::cas_retry_schedule`]). Callers read a record, mutate a copy, bump
//! its version, and write it back conditioned on the version they read. A
//! [`CasOutcome::VersionConflict`] means someone else got there first.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
  AttemptError, ExecutionRecord, ExecutionStatus, RetryContext, RetrySchedule, RetryStatus,
  RetryType, WaitState, WaitStatus,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A uniqueness constraint rejected the write.
  #[error("conflict: {0}")]
  Conflict(String),

  /// The in-memory store's lock was poisoned by a panicking writer.
  #[error("store lock poisoned")]
  LockPoisoned,

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Result of a version-checked conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
  /// The stored version matched and the write was applied.
  Applied,
  /// The stored version did not match.
  VersionConflict { actual: i64 },
  /// No record with that id exists.
  NotFound,
}

impl CasOutcome {
  #[must_use]
  pub const fn is_applied(&self) -> bool {
    matches!(self, Self::Applied)
  }
}

/// Storage trait for executions, wait states, and retry schedules.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create a new workflow execution.
  async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), Error>;

  /// Get a workflow execution by ID.
  async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, Error>;

  /// Update the status of a workflow execution.
  async fn update_execution_status(
    &self,
    execution_id: &str,
    status: ExecutionStatus,
    completed_at: Option<DateTime<Utc>>,
  ) -> Result<(), Error>;

  /// Record the output of a node that completed.
  async fn save_node_output(
    &self,
    execution_id: &str,
    node_id: &str,
    output: &Value,
  ) -> Result<(), Error>;

  /// Insert a new wait state.
  ///
  /// Fails with [`Error::Conflict`] if the correlation id is taken or the
  /// same (execution, node) pair already has a `Waiting` record.
  async fn insert_wait_state(&self, state: &WaitState) -> Result<(), Error>;

  async fn get_wait_state(&self, id: &str) -> Result<Option<WaitState>, Error>;

  /// The `Waiting` record holding this correlation id, if any.
  async fn find_waiting_by_correlation(
    &self,
    correlation_id: &str,
  ) -> Result<Option<WaitState>, Error>;

  /// The most recently created wait state for a node, in any status.
  async fn find_latest_wait_state(
    &self,
    execution_id: &str,
    node_id: &str,
  ) -> Result<Option<WaitState>, Error>;

  /// Replace a wait state if its stored version equals `expected_version`.
  ///
  /// `next.version` must already be `expected_version + 1`.
  async fn cas_wait_state(
    &self,
    expected_version: i64,
    next: &WaitState,
  ) -> Result<CasOutcome, Error>;

  /// `Waiting` records whose `expires_at` is at or before `now`, oldest first.
  async fn find_expired_waiting(
    &self,
    now: DateTime<Utc>,
    limit: u32,
  ) -> Result<Vec<WaitState>, Error>;

  /// Lease a `Waiting` record to one sweeper instance.
  ///
  /// Succeeds when the record is unclaimed, its lease has lapsed, or it is
  /// already held by `instance_id`. The claim bumps the version, so a
  /// concurrent ingestion write and the claimant's later write cannot both
  /// land. Returns the claimed record, or `None` if another instance holds it
  /// or it is no longer waiting.
  async fn claim_wait_state(
    &self,
    id: &str,
    instance_id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
  ) -> Result<Option<WaitState>, Error>;

  async fn insert_retry_schedule(&self, schedule: &RetrySchedule) -> Result<(), Error>;

  async fn get_retry_schedule(&self, id: &str) -> Result<Option<RetrySchedule>, Error>;

  /// Replace a retry schedule if its stored version equals `expected_version`.
  async fn cas_retry_schedule(
    &self,
    expected_version: i64,
    next: &RetrySchedule,
  ) -> Result<CasOutcome, Error>;

  /// `Pending` schedules whose `scheduled_at` is at or before `now`.
  async fn find_due_retry_schedules(
    &self,
    now: DateTime<Utc>,
    limit: u32,
  ) -> Result<Vec<RetrySchedule>, Error>;

  /// Non-terminal schedules that were due before `cutoff`.
  async fn find_stale_active_retry_schedules(
    &self,
    cutoff: DateTime<Utc>,
    limit: u32,
  ) -> Result<Vec<RetrySchedule>, Error>;

  /// Move terminal schedules last updated before `cutoff` to the archive.
  /// Returns how many were moved.
  async fn archive_terminal_retry_schedules(&self, cutoff: DateTime<Utc>) -> Result<u64, Error>;
}
