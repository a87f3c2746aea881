//! Retry schedule creation, dispatch and attempt bookkeeping.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use fuschia_config::RetryBlock;
use fuschia_engine::{Engine, FailureReport};
use fuschia_store::{
  AttemptError, CasOutcome, Error as StoreError, RetryContext, RetrySchedule, RetryStatus,
  RetryType, Store,
};
use fuschia_workflow::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::RetryError;
use crate::executor::{AttemptResult, RetryExecutor};
use crate::strategy::next_retry_at;

/// Inputs saved with a node retry so it can be replayed later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSnapshot {
  pub node_config: Value,
  pub input_data: Value,
  pub execution_context: Value,
}

/// How one dispatched schedule ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Executed {
  Completed,
  Rescheduled,
  Exhausted,
  /// Another instance took it, or it went terminal underneath us.
  Skipped,
}

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
  pub due: usize,
  pub completed: usize,
  pub rescheduled: usize,
  pub exhausted: usize,
  pub skipped: usize,
  pub errors: usize,
}

pub struct RetryScheduler {
  store: Arc<dyn Store>,
  engine: Arc<dyn Engine>,
  executor: RetryExecutor,
  batch_size: u32,
}

impl RetryScheduler {
  pub fn new(
    store: Arc<dyn Store>,
    engine: Arc<dyn Engine>,
    executor: RetryExecutor,
    batch_size: u32,
  ) -> Self {
    Self {
      store,
      engine,
      executor,
      batch_size,
    }
  }

  /// Schedule a retry of `node_id`. `target_id` identifies the failed node
  /// run.
  pub async fn create_for_node(
    &self,
    execution_id: &str,
    node_id: &str,
    target_id: &str,
    block: &RetryBlock,
    snapshot: NodeSnapshot,
  ) -> Result<RetrySchedule, RetryError> {
    let context = RetryContext::Node {
      node_config: snapshot.node_config,
      input_data: snapshot.input_data,
      execution_context: snapshot.execution_context,
    };
    self
      .create(
        RetryType::NodeExecution,
        target_id,
        execution_id,
        Some(node_id),
        block,
        context,
        Utc::now(),
      )
      .await
  }

  /// Schedule a restart of the whole execution from `trigger_data`.
  pub async fn create_for_execution(
    &self,
    execution_id: &str,
    block: &RetryBlock,
    trigger_data: Value,
  ) -> Result<RetrySchedule, RetryError> {
    self
      .create(
        RetryType::Execution,
        execution_id,
        execution_id,
        None,
        block,
        RetryContext::Execution { trigger_data },
        Utc::now(),
      )
      .await
  }

  #[allow(clippy::too_many_arguments)]
  #[instrument(skip(self, block, context))]
  async fn create(
    &self,
    retry_type: RetryType,
    target_id: &str,
    execution_id: &str,
    node_id: Option<&str>,
    block: &RetryBlock,
    context: RetryContext,
    now: DateTime<Utc>,
  ) -> Result<RetrySchedule, RetryError> {
    match self.store.get_execution(execution_id).await {
      Ok(_) => {}
      Err(StoreError::NotFound(_)) => {
        return Err(RetryError::ExecutionNotFound(execution_id.to_string()));
      }
      Err(e) => return Err(e.into()),
    }

    let policy = RetryPolicy::resolve(block);
    let schedule = RetrySchedule {
      id: uuid::Uuid::new_v4().to_string(),
      retry_type,
      target_id: target_id.to_string(),
      execution_id: execution_id.to_string(),
      node_id: node_id.map(String::from),
      scheduled_at: next_retry_at(&policy.backoff, 0, now),
      policy: Json(policy),
      current_attempt: 0,
      last_retried_at: None,
      status: RetryStatus::Pending,
      retry_context: Json(context),
      error_history: Json(Vec::new()),
      version: 1,
      created_at: now,
      updated_at: now,
    };
    self.store.insert_retry_schedule(&schedule).await?;

    info!(
      schedule_id = %schedule.id,
      strategy = schedule.policy.0.backoff.kind_str(),
      max_attempts = schedule.max_attempts(),
      scheduled_at = %schedule.scheduled_at,
      "retry_scheduled"
    );
    Ok(schedule)
  }

  /// Mark every due schedule `Scheduled` and execute them concurrently.
  ///
  /// Each schedule is isolated: an error on one is logged and counted.
  pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchReport, RetryError> {
    let due = self
      .store
      .find_due_retry_schedules(now, self.batch_size)
      .await?;
    let mut report = DispatchReport {
      due: due.len(),
      ..Default::default()
    };

    let mut claimed = Vec::with_capacity(due.len());
    for mut schedule in due {
      let expected = schedule.advance(now);
      schedule.status = RetryStatus::Scheduled;
      match self.store.cas_retry_schedule(expected, &schedule).await {
        Ok(CasOutcome::Applied) => claimed.push(schedule),
        Ok(outcome) => {
          debug!(schedule_id = %schedule.id, ?outcome, "retry_dispatch_skipped");
          report.skipped += 1;
        }
        Err(e) => {
          error!(schedule_id = %schedule.id, error = %e, "retry_dispatch_failed");
          report.errors += 1;
        }
      }
    }

    let runs = claimed.into_iter().map(|schedule| {
      let id = schedule.id.clone();
      async move { (id, self.execute(schedule, now).await) }
    });
    for (schedule_id, result) in futures::future::join_all(runs).await {
      match result {
        Ok(Executed::Completed) => report.completed += 1,
        Ok(Executed::Rescheduled) => report.rescheduled += 1,
        Ok(Executed::Exhausted) => report.exhausted += 1,
        Ok(Executed::Skipped) => report.skipped += 1,
        Err(e) => {
          error!(%schedule_id, error = %e, "retry_execution_failed");
          report.errors += 1;
        }
      }
    }
    Ok(report)
  }

  /// Make one attempt and record its result.
  ///
  /// Success completes the schedule. Failure appends to the error history
  /// and either reschedules or, once `max_attempts` is reached, fails the
  /// schedule and reports the failure to the engine.
  #[instrument(skip_all, fields(schedule_id = %schedule.id, execution_id = %schedule.execution_id))]
  pub async fn execute(
    &self,
    mut schedule: RetrySchedule,
    now: DateTime<Utc>,
  ) -> Result<Executed, RetryError> {
    if schedule.status.is_terminal() {
      return Ok(Executed::Skipped);
    }

    let expected = schedule.advance(now);
    schedule.current_attempt += 1;
    schedule.status = RetryStatus::Retrying;
    schedule.last_retried_at = Some(now);
    if !self.commit(expected, &schedule).await? {
      return Ok(Executed::Skipped);
    }

    let attempt = schedule.attempt();
    info!(attempt, max_attempts = schedule.max_attempts(), "retry_attempt_started");
    let result = self.executor.run(&schedule).await;

    // The attempt may have run for a while; later bookkeeping is relative
    // to when it finished.
    let finished = Utc::now().max(now);
    let expected = schedule.advance(finished);
    let executed = match result {
      AttemptResult::Succeeded { .. } => {
        schedule.status = RetryStatus::Completed;
        Executed::Completed
      }
      AttemptResult::Failed {
        message,
        error_type,
      } => {
        warn!(attempt, %error_type, error = %message, "retry_attempt_failed");
        schedule.error_history.0.push(AttemptError {
          attempt,
          timestamp: finished,
          message: message.clone(),
          error_type,
        });
        if attempt >= schedule.max_attempts() {
          schedule.status = RetryStatus::Failed;
          Executed::Exhausted
        } else {
          schedule.status = RetryStatus::Pending;
          schedule.scheduled_at = next_retry_at(&schedule.policy.0.backoff, attempt, finished);
          Executed::Rescheduled
        }
      }
    };

    if !self.commit(expected, &schedule).await? {
      warn!(?executed, "retry_result_not_persisted");
      return Ok(Executed::Skipped);
    }

    match executed {
      Executed::Completed => {
        self.executor.cache().remove(&schedule.id);
        info!(attempt, "retry_succeeded")
      }
      Executed::Rescheduled => {
        info!(attempt, scheduled_at = %schedule.scheduled_at, "retry_rescheduled")
      }
      Executed::Exhausted => {
        self.executor.cache().remove(&schedule.id);
        self.report_exhausted(&schedule).await
      }
      Executed::Skipped => {}
    }
    Ok(executed)
  }

  async fn report_exhausted(&self, schedule: &RetrySchedule) {
    let last = schedule
      .error_history
      .0
      .last()
      .map(|e| e.message.as_str())
      .unwrap_or("unknown error");
    let message = format!("max attempts reached: {last}");
    warn!(
      attempts = schedule.current_attempt,
      error = %message,
      "retry_exhausted"
    );

    let mut report = FailureReport::new(&schedule.execution_id, message)
      .with_error_type("MaxAttemptsReached");
    if let Some(node_id) = &schedule.node_id {
      report = report.with_node(node_id);
    }
    if let Err(e) = self.engine.report_failure(report).await {
      warn!(error = %e, "failure_report_failed");
    }
  }

  async fn commit(&self, expected: i64, schedule: &RetrySchedule) -> Result<bool, RetryError> {
    match self.store.cas_retry_schedule(expected, schedule).await? {
      CasOutcome::Applied => Ok(true),
      outcome => {
        debug!(?outcome, "retry_commit_conflict");
        Ok(false)
      }
    }
  }
}

/// Runs [`RetryScheduler::dispatch_due`] on a fixed interval.
pub struct RetryDispatcher {
  scheduler: Arc<RetryScheduler>,
  interval: StdDuration,
}

impl RetryDispatcher {
  pub fn new(scheduler: Arc<RetryScheduler>, interval: StdDuration) -> Self {
    Self {
      scheduler,
      interval,
    }
  }

  pub async fn run(&self, cancel: CancellationToken) {
    info!(interval_secs = self.interval.as_secs(), "starting retry dispatcher");
    let mut ticker = tokio::time::interval(self.interval);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("retry dispatcher cancelled");
          break;
        }
        _ = ticker.tick() => {
          match self.scheduler.dispatch_due(Utc::now()).await {
            Ok(report) if report.due > 0 => info!(?report, "retry_dispatch_finished"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "retry_dispatch_failed"),
          }
        }
      }
    }
  }
}
