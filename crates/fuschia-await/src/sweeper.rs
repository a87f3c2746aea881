//! Timeout sweeping.
//!
//! Periodically collects expired `Waiting` records, leases each one, and
//! either times it out or resumes it with whatever arrived, per the node's
//! `onTimeout` policy.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use fuschia_engine::{Engine, FailureReport};
use fuschia_store::{CasOutcome, Store, WaitState, WaitStatus};
use fuschia_workflow::OnTimeout;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::{ResumeCoordinator, ResumeOutcome, aggregate};
use crate::error::AwaitError;
use crate::evaluator::wait_satisfied;

pub const TIMEOUT_MESSAGE: &str = "Timeout waiting for events";

#[derive(Debug, Clone)]
pub struct SweeperConfig {
  pub interval: StdDuration,
  pub batch_size: u32,
  pub claim_ttl: Duration,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  pub expired: usize,
  pub timed_out: usize,
  pub resumed: usize,
  /// Resumed but the engine rejected it.
  pub failed: usize,
  /// Claimed elsewhere or changed underneath us.
  pub skipped: usize,
  pub errors: usize,
}

enum Swept {
  TimedOut,
  Resumed,
  Failed,
  Skipped,
}

enum Decision {
  TimeOut,
  Continue { partial: bool },
}

pub struct TimeoutSweeper {
  store: Arc<dyn Store>,
  engine: Arc<dyn Engine>,
  coordinator: Arc<ResumeCoordinator>,
  config: SweeperConfig,
}

impl TimeoutSweeper {
  pub fn new(
    store: Arc<dyn Store>,
    engine: Arc<dyn Engine>,
    coordinator: Arc<ResumeCoordinator>,
    config: SweeperConfig,
  ) -> Self {
    Self {
      store,
      engine,
      coordinator,
      config,
    }
  }

  /// Sweep every `interval` until cancelled.
  pub async fn run(&self, cancel: CancellationToken) {
    info!(
      interval_secs = self.config.interval.as_secs(),
      instance_id = %self.coordinator.instance_id(),
      "starting timeout sweeper"
    );
    let mut ticker = tokio::time::interval(self.config.interval);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("timeout sweeper cancelled");
          break;
        }
        _ = ticker.tick() => {
          match self.sweep_once(Utc::now()).await {
            Ok(report) if report.expired > 0 => info!(?report, "timeout_sweep_finished"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "timeout_sweep_failed"),
          }
        }
      }
    }
  }

  /// Process every wait state expired at `now`, up to the batch size.
  ///
  /// A failure on one record is logged and counted; it never stops the rest.
  pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, AwaitError> {
    let expired = self
      .store
      .find_expired_waiting(now, self.config.batch_size)
      .await?;
    let mut report = SweepReport {
      expired: expired.len(),
      ..Default::default()
    };

    for state in expired {
      match self.sweep_item(&state, now).await {
        Ok(Swept::TimedOut) => report.timed_out += 1,
        Ok(Swept::Resumed) => report.resumed += 1,
        Ok(Swept::Failed) => report.failed += 1,
        Ok(Swept::Skipped) => report.skipped += 1,
        Err(e) => {
          report.errors += 1;
          error!(
            wait_state_id = %state.id,
            execution_id = %state.execution_id,
            error = %e,
            "timeout_sweep_item_failed"
          );
        }
      }
    }
    Ok(report)
  }

  #[instrument(skip_all, fields(wait_state_id = %candidate.id, node_id = %candidate.node_id))]
  async fn sweep_item(
    &self,
    candidate: &WaitState,
    now: DateTime<Utc>,
  ) -> Result<Swept, AwaitError> {
    let instance_id = self.coordinator.instance_id();
    let Some(mut state) = self
      .store
      .claim_wait_state(&candidate.id, instance_id, now, self.config.claim_ttl)
      .await?
    else {
      debug!("timeout_claim_skipped");
      return Ok(Swept::Skipped);
    };

    let decision = decide(&state);
    let expected = state.advance(now);
    state.resumed_at = Some(now);
    state.resumed_by = Some(instance_id.to_string());
    state.claimed_by = None;
    state.claimed_until = None;

    match decision {
      Decision::TimeOut => {
        state.status = WaitStatus::Timeout;
        state.failure = Some(TIMEOUT_MESSAGE.to_string());
        if !self.commit(expected, &state).await? {
          return Ok(Swept::Skipped);
        }
        let elapsed_ms = (now - state.created_at).num_milliseconds();
        info!(
          execution_id = %state.execution_id,
          elapsed_ms,
          on_timeout = ?state.on_timeout,
          "wait_state_timed_out"
        );
        let report = FailureReport::new(&state.execution_id, TIMEOUT_MESSAGE)
          .with_node(&state.node_id)
          .with_error_type("Timeout")
          .with_elapsed_ms(elapsed_ms);
        if let Err(e) = self.engine.report_failure(report).await {
          warn!(execution_id = %state.execution_id, error = %e, "failure_report_failed");
        }
        Ok(Swept::TimedOut)
      }
      Decision::Continue { partial } => {
        state.status = WaitStatus::Resuming;
        if !self.commit(expected, &state).await? {
          return Ok(Swept::Skipped);
        }
        info!(execution_id = %state.execution_id, partial, "wait_state_continued_after_timeout");
        let payload = aggregate(&state, partial);
        match self.coordinator.finish(state, payload).await? {
          ResumeOutcome::Resumed => Ok(Swept::Resumed),
          _ => Ok(Swept::Failed),
        }
      }
    }
  }

  /// Conditional write of the swept record. `false` means ingestion got in
  /// between the claim and now; the record is left for the next sweep.
  async fn commit(&self, expected: i64, state: &WaitState) -> Result<bool, AwaitError> {
    match self.store.cas_wait_state(expected, state).await? {
      CasOutcome::Applied => Ok(true),
      outcome => {
        debug!(?outcome, "timeout_commit_conflict");
        Ok(false)
      }
    }
  }
}

fn decide(state: &WaitState) -> Decision {
  let received = state.received_enabled();
  if received.is_empty() {
    return Decision::TimeOut;
  }
  let partial = state
    .enabled_events
    .0
    .iter()
    .any(|k| !received.contains(k));
  match state.on_timeout {
    OnTimeout::Fail => Decision::TimeOut,
    OnTimeout::Continue if wait_satisfied(state) => Decision::Continue { partial },
    OnTimeout::Continue => Decision::TimeOut,
    OnTimeout::ContinueWithPartial => Decision::Continue { partial },
  }
}
