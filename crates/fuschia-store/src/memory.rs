//! In-memory [`Store`] for tests and the `--in-memory` CLI mode.
//!
//! State is lost when the process exits. All maps sit behind one mutex so
//! conditional writes are linearizable within the process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::types::{
  ExecutionRecord, ExecutionStatus, RetrySchedule, RetryStatus, WaitState, WaitStatus,
};
use crate::{CasOutcome, Error, Store};

#[derive(Debug, Default)]
struct State {
  executions: HashMap<String, ExecutionRecord>,
  wait_states: HashMap<String, WaitState>,
  retry_schedules: HashMap<String, RetrySchedule>,
  archived: Vec<RetrySchedule>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
  state: Mutex<State>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
  Error::LockPoisoned
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, State>, Error> {
    self.state.lock().map_err(poison_err)
  }

  /// Schedules moved out by [`Store::archive_terminal_retry_schedules`].
  pub fn archived_retry_schedules(&self) -> Result<Vec<RetrySchedule>, Error> {
    Ok(self.lock()?.archived.clone())
  }

  /// Every wait state recorded for an execution, in creation order.
  pub fn wait_states_for(&self, execution_id: &str) -> Result<Vec<WaitState>, Error> {
    let state = self.lock()?;
    let mut found: Vec<WaitState> = state
      .wait_states
      .values()
      .filter(|w| w.execution_id == execution_id)
      .cloned()
      .collect();
    found.sort_by_key(|w| w.created_at);
    Ok(found)
  }

  /// Every retry schedule for an execution, in creation order.
  pub fn retry_schedules_for(&self, execution_id: &str) -> Result<Vec<RetrySchedule>, Error> {
    let state = self.lock()?;
    let mut found: Vec<RetrySchedule> = state
      .retry_schedules
      .values()
      .filter(|s| s.execution_id == execution_id)
      .cloned()
      .collect();
    found.sort_by_key(|s| s.created_at);
    Ok(found)
  }
}

fn cas_miss(stored: Option<i64>) -> CasOutcome {
  match stored {
    Some(actual) => CasOutcome::VersionConflict { actual },
    None => CasOutcome::NotFound,
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), Error> {
    let mut state = self.lock()?;
    if state.executions.contains_key(&execution.execution_id) {
      return Err(Error::Conflict(format!(
        "execution {}",
        execution.execution_id
      )));
    }
    state
      .executions
      .insert(execution.execution_id.clone(), execution.clone());
    Ok(())
  }

  async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord, Error> {
    self
      .lock()?
      .executions
      .get(execution_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))
  }

  async fn update_execution_status(
    &self,
    execution_id: &str,
    status: ExecutionStatus,
    completed_at: Option<DateTime<Utc>>,
  ) -> Result<(), Error> {
    let mut state = self.lock()?;
    let execution = state
      .executions
      .get_mut(execution_id)
      .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;
    execution.status = status;
    execution.completed_at = completed_at;
    Ok(())
  }

  async fn save_node_output(
    &self,
    execution_id: &str,
    node_id: &str,
    output: &Value,
  ) -> Result<(), Error> {
    let mut state = self.lock()?;
    let execution = state
      .executions
      .get_mut(execution_id)
      .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;
    execution
      .node_outputs
      .0
      .insert(node_id.to_string(), output.clone());
    Ok(())
  }

  async fn insert_wait_state(&self, wait: &WaitState) -> Result<(), Error> {
    let mut state = self.lock()?;
    let clash = state.wait_states.values().any(|w| {
      w.id == wait.id
        || w.correlation_id == wait.correlation_id
        || (wait.status == WaitStatus::Waiting
          && w.status == WaitStatus::Waiting
          && w.execution_id == wait.execution_id
          && w.node_id == wait.node_id)
    });
    if clash {
      return Err(Error::Conflict(format!(
        "wait state for {}/{}",
        wait.execution_id, wait.node_id
      )));
    }
    state.wait_states.insert(wait.id.clone(), wait.clone());
    Ok(())
  }

  async fn get_wait_state(&self, id: &str) -> Result<Option<WaitState>, Error> {
    Ok(self.lock()?.wait_states.get(id).cloned())
  }

  async fn find_waiting_by_correlation(
    &self,
    correlation_id: &str,
  ) -> Result<Option<WaitState>, Error> {
    Ok(
      self
        .lock()?
        .wait_states
        .values()
        .find(|w| w.correlation_id == correlation_id && w.status == WaitStatus::Waiting)
        .cloned(),
    )
  }

  async fn find_latest_wait_state(
    &self,
    execution_id: &str,
    node_id: &str,
  ) -> Result<Option<WaitState>, Error> {
    Ok(
      self
        .lock()?
        .wait_states
        .values()
        .filter(|w| w.execution_id == execution_id && w.node_id == node_id)
        .max_by_key(|w| (w.created_at, w.status == WaitStatus::Waiting))
        .cloned(),
    )
  }

  async fn cas_wait_state(
    &self,
    expected_version: i64,
    next: &WaitState,
  ) -> Result<CasOutcome, Error> {
    let mut state = self.lock()?;
    match state.wait_states.get_mut(&next.id) {
      Some(current) if current.version == expected_version => {
        *current = next.clone();
        Ok(CasOutcome::Applied)
      }
      other => Ok(cas_miss(other.map(|w| w.version))),
    }
  }

  async fn find_expired_waiting(
    &self,
    now: DateTime<Utc>,
    limit: u32,
  ) -> Result<Vec<WaitState>, Error> {
    let state = self.lock()?;
    let mut expired: Vec<WaitState> = state
      .wait_states
      .values()
      .filter(|w| w.status == WaitStatus::Waiting && w.expires_at <= now)
      .cloned()
      .collect();
    expired.sort_by_key(|w| w.expires_at);
    expired.truncate(limit as usize);
    Ok(expired)
  }

  async fn claim_wait_state(
    &self,
    id: &str,
    instance_id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
  ) -> Result<Option<WaitState>, Error> {
    let mut state = self.lock()?;
    let Some(wait) = state.wait_states.get_mut(id) else {
      return Ok(None);
    };
    let free = match (&wait.claimed_by, wait.claimed_until) {
      (_, None) => true,
      (holder, Some(until)) => until <= now || holder.as_deref() == Some(instance_id),
    };
    if wait.status != WaitStatus::Waiting || !free {
      return Ok(None);
    }
    wait.claimed_by = Some(instance_id.to_string());
    wait.claimed_until = Some(now + ttl);
    wait.advance(now);
    Ok(Some(wait.clone()))
  }

  async fn insert_retry_schedule(&self, schedule: &RetrySchedule) -> Result<(), Error> {
    let mut state = self.lock()?;
    if state.retry_schedules.contains_key(&schedule.id) {
      return Err(Error::Conflict(format!("retry schedule {}", schedule.id)));
    }
    state
      .retry_schedules
      .insert(schedule.id.clone(), schedule.clone());
    Ok(())
  }

  async fn get_retry_schedule(&self, id: &str) -> Result<Option<RetrySchedule>, Error> {
    Ok(self.lock()?.retry_schedules.get(id).cloned())
  }

  async fn cas_retry_schedule(
    &self,
    expected_version: i64,
    next: &RetrySchedule,
  ) -> Result<CasOutcome, Error> {
    let mut state = self.lock()?;
    match state.retry_schedules.get_mut(&next.id) {
      Some(current) if current.version == expected_version => {
        *current = next.clone();
        Ok(CasOutcome::Applied)
      }
      other => Ok(cas_miss(other.map(|s| s.version))),
    }
  }

  async fn find_due_retry_schedules(
    &self,
    now: DateTime<Utc>,
    limit: u32,
  ) -> Result<Vec<RetrySchedule>, Error> {
    let state = self.lock()?;
    let mut due: Vec<RetrySchedule> = state
      .retry_schedules
      .values()
      .filter(|s| s.status == RetryStatus::Pending && s.scheduled_at <= now)
      .cloned()
      .collect();
    due.sort_by_key(|s| s.scheduled_at);
    due.truncate(limit as usize);
    Ok(due)
  }

  async fn find_stale_active_retry_schedules(
    &self,
    cutoff: DateTime<Utc>,
    limit: u32,
  ) -> Result<Vec<RetrySchedule>, Error> {
    let state = self.lock()?;
    let mut stale: Vec<RetrySchedule> = state
      .retry_schedules
      .values()
      .filter(|s| !s.status.is_terminal() && s.scheduled_at < cutoff)
      .cloned()
      .collect();
    stale.sort_by_key(|s| s.scheduled_at);
    stale.truncate(limit as usize);
    Ok(stale)
  }

  async fn archive_terminal_retry_schedules(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
    let mut state = self.lock()?;
    let ids: Vec<String> = state
      .retry_schedules
      .values()
      .filter(|s| s.status.is_terminal() && s.updated_at < cutoff)
      .map(|s| s.id.clone())
      .collect();
    for id in &ids {
      if let Some(schedule) = state.retry_schedules.remove(id) {
        state.archived.push(schedule);
      }
    }
    Ok(ids.len() as u64)
  }
}
