use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use tracing::debug;

use crate::types::{
  ExecutionRecord, ExecutionStatus, RetrySchedule, RetryStatus, WaitState, WaitStatus,
};
use crate::{CasOutcome, Error, Store};

const WAIT_STATE_COLUMNS: &str = "id, execution_id, node_id, correlation_id, aggregation_strategy, \
   enabled_events, required_events, on_timeout, received_events, api_response_data, \
   message_event_data, status, version, resumed_at, resumed_by, failure, claimed_by, \
   claimed_until, created_at, updated_at, expires_at";

const RETRY_SCHEDULE_COLUMNS: &str = "id, retry_type, target_id, execution_id, node_id, policy, \
   current_attempt, scheduled_at, last_retried_at, status, retry_context, error_history, \
   version, created_at, updated_at";

/// SQLite-backed [`Store`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database at `url` and run migrations.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?
      .create_if_missing(true)
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// A private in-memory database. All access goes through one connection
  /// so every caller sees the same database.
  pub async fn in_memory() -> Result<Self, Error> {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect("sqlite::memory:")
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("../../migrations")
      .run(&self.pool)
      .await
      .map_err(sqlx::Error::from)?;
    Ok(())
  }

  async fn current_version(&self, table: &str, id: &str) -> Result<Option<i64>, Error> {
    let sql = format!("SELECT version FROM {table} WHERE id = ?");
    let version: Option<i64> = sqlx::query_scalar(&sql)
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(version)
  }

  async fn cas_miss(&self, table: &str, id: &str) -> Result<CasOutcome, Error> {
    Ok(match self.current_version(table, id).await? {
      Some(actual) => CasOutcome::VersionConflict { actual },
      None => CasOutcome::NotFound,
    })
  }
}

fn unique_violation(err: sqlx::Error, what: &str) -> Error {
  match err {
    sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(what.to_string()),
    other => Error::Database(other),
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), Error> {
    sqlx::query(
      "INSERT INTO workflow_executions (execution_id, workflow_id, status, trigger_data, \
       node_outputs, variables, metadata, started_at, completed_at) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&execution.execution_id)
    .bind(&execution.workflow_id)
    .bind(execution.status)
    .bind(&execution.trigger_data)
    .bind(&execution.node_outputs)
    .bind(&execution.variables)
    .bind(&execution.metadata)
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .execute(&self.pool)
    .await
    .map_err(|e| unique_violation(e, &format!("execution {}", execution.execution_id)))?;
    Ok(())
  }

  async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, Error> {
    sqlx::query_as::<_, ExecutionRecord>(
      "SELECT execution_id, workflow_id, status, trigger_data, node_outputs, variables, \
       metadata, started_at, completed_at FROM workflow_executions WHERE execution_id = ?",
    )
    .bind(execution_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))
  }

  async fn update_execution_status(
    &self,
    execution_id: &str,
    status: ExecutionStatus,
    completed_at: Option<DateTime<Utc>>,
  ) -> Result<(), Error> {
    let result = sqlx::query(
      "UPDATE workflow_executions SET status = ?, completed_at = ? WHERE execution_id = ?",
    )
    .bind(status)
    .bind(completed_at)
    .bind(execution_id)
    .execute(&self.pool)
    .await?;
    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("execution {execution_id}")));
    }
    Ok(())
  }

  async fn save_node_output(
    &self,
    execution_id: &str,
    node_id: &str,
    output: &Value,
  ) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    let outputs: Option<Json<serde_json::Map<String, Value>>> =
      sqlx::query_scalar("SELECT node_outputs FROM workflow_executions WHERE execution_id = ?")
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(Json(mut outputs)) = outputs else {
      return Err(Error::NotFound(format!("execution {execution_id}")));
    };
    outputs.insert(node_id.to_string(), output.clone());
    sqlx::query("UPDATE workflow_executions SET node_outputs = ? WHERE execution_id = ?")
      .bind(Json(&outputs))
      .bind(execution_id)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;
    Ok(())
  }

  async fn insert_wait_state(&self, state: &WaitState) -> Result<(), Error> {
    let sql = format!(
      "INSERT INTO wait_states ({WAIT_STATE_COLUMNS}) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
      .bind(&state.id)
      .bind(&state.execution_id)
      .bind(&state.node_id)
      .bind(&state.correlation_id)
      .bind(state.aggregation_strategy)
      .bind(&state.enabled_events)
      .bind(&state.required_events)
      .bind(state.on_timeout)
      .bind(&state.received_events)
      .bind(&state.api_response_data)
      .bind(&state.message_event_data)
      .bind(state.status)
      .bind(state.version)
      .bind(state.resumed_at)
      .bind(&state.resumed_by)
      .bind(&state.failure)
      .bind(&state.claimed_by)
      .bind(state.claimed_until)
      .bind(state.created_at)
      .bind(state.updated_at)
      .bind(state.expires_at)
      .execute(&self.pool)
      .await
      .map_err(|e| {
        unique_violation(
          e,
          &format!("wait state for {}/{}", state.execution_id, state.node_id),
        )
      })?;
    Ok(())
  }

  async fn get_wait_state(&self, id: &str) -> Result<Option<WaitState>, Error> {
    let sql = format!("SELECT {WAIT_STATE_COLUMNS} FROM wait_states WHERE id = ?");
    Ok(
      sqlx::query_as::<_, WaitState>(&sql)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?,
    )
  }

  async fn find_waiting_by_correlation(
    &self,
    correlation_id: &str,
  ) -> Result<Option<WaitState>, Error> {
    let sql = format!(
      "SELECT {WAIT_STATE_COLUMNS} FROM wait_states WHERE correlation_id = ? AND status = ?"
    );
    Ok(
      sqlx::query_as::<_, WaitState>(&sql)
        .bind(correlation_id)
        .bind(WaitStatus::Waiting)
        .fetch_optional(&self.pool)
        .await?,
    )
  }

  async fn find_latest_wait_state(
    &self,
    execution_id: &str,
    node_id: &str,
  ) -> Result<Option<WaitState>, Error> {
    let sql = format!(
      "SELECT {WAIT_STATE_COLUMNS} FROM wait_states WHERE execution_id = ? AND node_id = ? \
       ORDER BY created_at DESC, rowid DESC LIMIT 1"
    );
    Ok(
      sqlx::query_as::<_, WaitState>(&sql)
        .bind(execution_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?,
    )
  }

  async fn cas_wait_state(
    &self,
    expected_version: i64,
    next: &WaitState,
  ) -> Result<CasOutcome, Error> {
    let result = sqlx::query(
      "UPDATE wait_states SET received_events = ?, api_response_data = ?, \
       message_event_data = ?, status = ?, version = ?, resumed_at = ?, resumed_by = ?, \
       failure = ?, claimed_by = ?, claimed_until = ?, updated_at = ? \
       WHERE id = ? AND version = ?",
    )
    .bind(&next.received_events)
    .bind(&next.api_response_data)
    .bind(&next.message_event_data)
    .bind(next.status)
    .bind(next.version)
    .bind(next.resumed_at)
    .bind(&next.resumed_by)
    .bind(&next.failure)
    .bind(&next.claimed_by)
    .bind(next.claimed_until)
    .bind(next.updated_at)
    .bind(&next.id)
    .bind(expected_version)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 1 {
      return Ok(CasOutcome::Applied);
    }
    let outcome = self.cas_miss("wait_states", &next.id).await?;
    debug!(wait_state_id = %next.id, expected_version, ?outcome, "wait_state_cas_missed");
    Ok(outcome)
  }

  async fn find_expired_waiting(
    &self,
    now: DateTime<Utc>,
    limit: u32,
  ) -> Result<Vec<WaitState>, Error> {
    let sql = format!(
      "SELECT {WAIT_STATE_COLUMNS} FROM wait_states WHERE status = ? AND expires_at <= ? \
       ORDER BY expires_at LIMIT ?"
    );
    Ok(
      sqlx::query_as::<_, WaitState>(&sql)
        .bind(WaitStatus::Waiting)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?,
    )
  }

  async fn claim_wait_state(
    &self,
    id: &str,
    instance_id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
  ) -> Result<Option<WaitState>, Error> {
    let result = sqlx::query(
      "UPDATE wait_states SET claimed_by = ?, claimed_until = ?, version = version + 1, \
       updated_at = ? \
       WHERE id = ? AND status = ? \
       AND (claimed_until IS NULL OR claimed_until <= ? OR claimed_by = ?)",
    )
    .bind(instance_id)
    .bind(now + ttl)
    .bind(now)
    .bind(id)
    .bind(WaitStatus::Waiting)
    .bind(now)
    .bind(instance_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Ok(None);
    }
    self.get_wait_state(id).await
  }

  async fn insert_retry_schedule(&self, schedule: &RetrySchedule) -> Result<(), Error> {
    let sql = format!(
      "INSERT INTO retry_schedules ({RETRY_SCHEDULE_COLUMNS}) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
      .bind(&schedule.id)
      .bind(schedule.retry_type)
      .bind(&schedule.target_id)
      .bind(&schedule.execution_id)
      .bind(&schedule.node_id)
      .bind(&schedule.policy)
      .bind(schedule.current_attempt)
      .bind(schedule.scheduled_at)
      .bind(schedule.last_retried_at)
      .bind(schedule.status)
      .bind(&schedule.retry_context)
      .bind(&schedule.error_history)
      .bind(schedule.version)
      .bind(schedule.created_at)
      .bind(schedule.updated_at)
      .execute(&self.pool)
      .await
      .map_err(|e| unique_violation(e, &format!("retry schedule {}", schedule.id)))?;
    Ok(())
  }

  async fn get_retry_schedule(&self, id: &str) -> Result<Option<RetrySchedule>, Error> {
    let sql = format!("SELECT {RETRY_SCHEDULE_COLUMNS} FROM retry_schedules WHERE id = ?");
    Ok(
      sqlx::query_as::<_, RetrySchedule>(&sql)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?,
    )
  }

  async fn cas_retry_schedule(
    &self,
    expected_version: i64,
    next: &RetrySchedule,
  ) -> Result<CasOutcome, Error> {
    let result = sqlx::query(
      "UPDATE retry_schedules SET current_attempt = ?, scheduled_at = ?, last_retried_at = ?, \
       status = ?, retry_context = ?, error_history = ?, version = ?, updated_at = ? \
       WHERE id = ? AND version = ?",
    )
    .bind(next.current_attempt)
    .bind(next.scheduled_at)
    .bind(next.last_retried_at)
    .bind(next.status)
    .bind(&next.retry_context)
    .bind(&next.error_history)
    .bind(next.version)
    .bind(next.updated_at)
    .bind(&next.id)
    .bind(expected_version)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 1 {
      return Ok(CasOutcome::Applied);
    }
    let outcome = self.cas_miss("retry_schedules", &next.id).await?;
    debug!(retry_schedule_id = %next.id, expected_version, ?outcome, "retry_schedule_cas_missed");
    Ok(outcome)
  }

  async fn find_due_retry_schedules(
    &self,
    now: DateTime<Utc>,
    limit: u32,
  ) -> Result<Vec<RetrySchedule>, Error> {
    let sql = format!(
      "SELECT {RETRY_SCHEDULE_COLUMNS} FROM retry_schedules \
       WHERE status = ? AND scheduled_at <= ? ORDER BY scheduled_at LIMIT ?"
    );
    Ok(
      sqlx::query_as::<_, RetrySchedule>(&sql)
        .bind(RetryStatus::Pending)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?,
    )
  }

  async fn find_stale_active_retry_schedules(
    &self,
    cutoff: DateTime<Utc>,
    limit: u32,
  ) -> Result<Vec<RetrySchedule>, Error> {
    let sql = format!(
      "SELECT {RETRY_SCHEDULE_COLUMNS} FROM retry_schedules \
       WHERE status IN ('pending', 'scheduled', 'retrying') AND scheduled_at < ? \
       ORDER BY scheduled_at LIMIT ?"
    );
    Ok(
      sqlx::query_as::<_, RetrySchedule>(&sql)
        .bind(cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?,
    )
  }

  async fn archive_terminal_retry_schedules(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
    let filter = "status IN ('completed', 'failed', 'cancelled') AND updated_at < ?";
    let mut tx = self.pool.begin().await?;
    let copy = format!(
      "INSERT INTO retry_schedules_archive ({RETRY_SCHEDULE_COLUMNS}, archived_at) \
       SELECT {RETRY_SCHEDULE_COLUMNS}, ? FROM retry_schedules WHERE {filter}"
    );
    sqlx::query(&copy)
      .bind(Utc::now())
      .bind(cutoff)
      .execute(&mut *tx)
      .await?;
    let delete = format!("DELETE FROM retry_schedules WHERE {filter}");
    let moved = sqlx::query(&delete)
      .bind(cutoff)
      .execute(&mut *tx)
      .await?
      .rows_affected();
    tx.commit().await?;
    Ok(moved)
  }
}
