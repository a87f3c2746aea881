//! Periodic cleanup of retry schedules.
//!
//! Schedules stuck in a non-terminal status long past their due time are
//! failed, and terminal schedules past the retention window are moved to the
//! archive.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use fuschia_engine::{Engine, FailureReport};
use fuschia_store::{AttemptError, CasOutcome, RetrySchedule, RetryStatus, Store};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ContextCache;
use crate::error::RetryError;

pub const ABANDONED: &str = "Abandoned";

#[derive(Debug, Clone)]
pub struct CleanupConfig {
  pub interval: StdDuration,
  /// Terminal schedules are archived this long after their last update.
  pub terminal_retention: Duration,
  /// Active schedules due longer ago than this are failed.
  pub stale_after: Duration,
  pub batch_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
  pub abandoned: usize,
  pub archived: u64,
  pub errors: usize,
}

pub struct Cleanup {
  store: Arc<dyn Store>,
  engine: Arc<dyn Engine>,
  cache: Arc<ContextCache>,
  config: CleanupConfig,
}

impl Cleanup {
  pub fn new(
    store: Arc<dyn Store>,
    engine: Arc<dyn Engine>,
    cache: Arc<ContextCache>,
    config: CleanupConfig,
  ) -> Self {
    Self {
      store,
      engine,
      cache,
      config,
    }
  }

  pub async fn run(&self, cancel: CancellationToken) {
    info!(interval_secs = self.config.interval.as_secs(), "starting retry cleanup");
    let mut ticker = tokio::time::interval(self.config.interval);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("retry cleanup cancelled");
          break;
        }
        _ = ticker.tick() => {
          match self.run_once(Utc::now()).await {
            Ok(report) => info!(?report, "retry_cleanup_finished"),
            Err(e) => error!(error = %e, "retry_cleanup_failed"),
          }
        }
      }
    }
  }

  pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupReport, RetryError> {
    let mut report = CleanupReport::default();

    let stale_cutoff = now
      .checked_sub_signed(self.config.stale_after)
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let stale = self
      .store
      .find_stale_active_retry_schedules(stale_cutoff, self.config.batch_size)
      .await?;
    for schedule in stale {
      let id = schedule.id.clone();
      match self.abandon(schedule, now).await {
        Ok(true) => report.abandoned += 1,
        Ok(false) => {}
        Err(e) => {
          error!(schedule_id = %id, error = %e, "retry_abandon_failed");
          report.errors += 1;
        }
      }
    }

    let retention_cutoff = now
      .checked_sub_signed(self.config.terminal_retention)
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    report.archived = self
      .store
      .archive_terminal_retry_schedules(retention_cutoff)
      .await?;
    Ok(report)
  }

  /// Fail a schedule that stopped making progress and tell the engine. An
  /// attempt that was in flight gets an error history entry; pending ones
  /// were already recorded.
  async fn abandon(
    &self,
    mut schedule: RetrySchedule,
    now: DateTime<Utc>,
  ) -> Result<bool, RetryError> {
    let was = schedule.status;
    let expected = schedule.advance(now);
    let message = format!("abandoned after no progress since {}", schedule.scheduled_at);
    if was == RetryStatus::Retrying {
      schedule.error_history.0.push(AttemptError {
        attempt: schedule.attempt(),
        timestamp: now,
        message: message.clone(),
        error_type: ABANDONED.to_string(),
      });
    }
    schedule.status = RetryStatus::Failed;

    match self.store.cas_retry_schedule(expected, &schedule).await? {
      CasOutcome::Applied => {
        warn!(
          schedule_id = %schedule.id,
          execution_id = %schedule.execution_id,
          status = ?was,
          scheduled_at = %schedule.scheduled_at,
          "retry_schedule_abandoned"
        );
        self.cache.remove(&schedule.id);
        let mut report =
          FailureReport::new(&schedule.execution_id, message).with_error_type(ABANDONED);
        if let Some(node_id) = &schedule.node_id {
          report = report.with_node(node_id);
        }
        if let Err(e) = self.engine.report_failure(report).await {
          warn!(schedule_id = %schedule.id, error = %e, "failure_report_failed");
        }
        Ok(true)
      }
      outcome => {
        debug!(schedule_id = %schedule.id, ?outcome, "retry_abandon_conflict");
        Ok(false)
      }
    }
  }
}
