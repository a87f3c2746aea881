//! Exactly-once resume.
//!
//! Every caller that believes a wait is satisfied calls
//! [`ResumeCoordinator::try_resume`]. They all read the current record and
//! race one conditional write from `Waiting` to `Resuming`; the store lets
//! exactly one of them through. Only the winner calls the engine.

use std::sync::Arc;

use chrono::Utc;
use fuschia_engine::{Engine, FailureReport};
use fuschia_store::{CasOutcome, Store, WaitState, WaitStatus};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::error::AwaitError;
use crate::evaluator::wait_satisfied;

/// What a resume attempt did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResumeOutcome {
  /// The node has no wait state.
  NotFound,
  /// The wait state left `Waiting` without being resumed (timed out).
  NotWaiting,
  /// Someone already resumed it.
  AlreadyResumed,
  /// The completion policy is not met.
  NotSatisfied,
  /// Another writer changed the record first.
  LostRace,
  /// This caller won and the engine accepted the resume.
  Resumed,
  /// This caller won but the engine rejected the resume.
  EngineFailed { message: String },
}

pub struct ResumeCoordinator {
  store: Arc<dyn Store>,
  engine: Arc<dyn Engine>,
  instance_id: String,
}

impl ResumeCoordinator {
  pub fn new(
    store: Arc<dyn Store>,
    engine: Arc<dyn Engine>,
    instance_id: impl Into<String>,
  ) -> Self {
    Self {
      store,
      engine,
      instance_id: instance_id.into(),
    }
  }

  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  #[instrument(skip(self), fields(instance_id = %self.instance_id))]
  pub async fn try_resume(
    &self,
    execution_id: &str,
    node_id: &str,
  ) -> Result<ResumeOutcome, AwaitError> {
    let Some(current) = self
      .store
      .find_latest_wait_state(execution_id, node_id)
      .await?
    else {
      return Ok(ResumeOutcome::NotFound);
    };

    if current.resumed_at.is_some() {
      debug!("resume_skipped_already_resumed");
      return Ok(ResumeOutcome::AlreadyResumed);
    }
    if current.status != WaitStatus::Waiting {
      return Ok(ResumeOutcome::NotWaiting);
    }
    if !wait_satisfied(&current) {
      return Ok(ResumeOutcome::NotSatisfied);
    }

    let mut next = current;
    let now = Utc::now();
    let expected = next.advance(now);
    next.status = WaitStatus::Resuming;
    next.resumed_at = Some(now);
    next.resumed_by = Some(self.instance_id.clone());

    match self.store.cas_wait_state(expected, &next).await? {
      CasOutcome::Applied => {}
      CasOutcome::VersionConflict { actual } => {
        debug!(expected, actual, "resume_lost_race");
        return Ok(ResumeOutcome::LostRace);
      }
      CasOutcome::NotFound => return Ok(ResumeOutcome::NotFound),
    }

    info!(correlation_id = %next.correlation_id, "resume_won");
    let payload = aggregate(&next, false);
    self.finish(next, payload).await
  }

  /// Call the engine for a wait state this instance has moved to `Resuming`,
  /// then record the result as `Completed` or `Failed`.
  pub async fn finish(
    &self,
    mut state: WaitState,
    payload: Value,
  ) -> Result<ResumeOutcome, AwaitError> {
    let result = self
      .engine
      .resume_execution(&state.execution_id, &state.node_id, payload)
      .await;

    let expected = state.advance(Utc::now());
    let outcome = match result {
      Ok(()) => {
        state.status = WaitStatus::Completed;
        ResumeOutcome::Resumed
      }
      Err(e) => {
        let message = e.to_string();
        error!(
          execution_id = %state.execution_id,
          node_id = %state.node_id,
          error = %message,
          "resume_engine_failed"
        );
        state.status = WaitStatus::Failed;
        state.failure = Some(message.clone());
        ResumeOutcome::EngineFailed { message }
      }
    };

    match self.store.cas_wait_state(expected, &state).await? {
      CasOutcome::Applied => {}
      other => {
        // Resuming records are only written by the instance that owns them.
        error!(
          wait_state_id = %state.id,
          outcome = ?other,
          "resume_finish_not_persisted"
        );
      }
    }

    if let ResumeOutcome::EngineFailed { message } = &outcome {
      let report = FailureReport::new(&state.execution_id, message.clone())
        .with_node(&state.node_id)
        .with_error_type("ResumeFailed");
      if let Err(e) = self.engine.report_failure(report).await {
        warn!(execution_id = %state.execution_id, error = %e, "failure_report_failed");
      }
    } else {
      info!(
        execution_id = %state.execution_id,
        node_id = %state.node_id,
        "wait_state_completed"
      );
    }
    Ok(outcome)
  }
}

/// The payload handed to the engine: each received event's data under its
/// kind, plus the correlation id and the list of kinds received.
pub fn aggregate(state: &WaitState, partial: bool) -> Value {
  let mut out = Map::new();
  let received = state.received_enabled();
  for kind in &received {
    if let Some(data) = state.payload(*kind) {
      out.insert(kind.as_str().to_string(), data.clone());
    }
  }
  out.insert("correlation_id".to_string(), json!(state.correlation_id));
  out.insert("received_events".to_string(), json!(received));
  if partial {
    out.insert("partial".to_string(), Value::Bool(true));
  }
  Value::Object(out)
}
