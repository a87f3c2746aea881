//! Event ingestion.
//!
//! Resolves an inbound api-response or message event to its wait state,
//! stores the payload at most once per event kind, and hands satisfied waits
//! to the [`ResumeCoordinator`].

use std::sync::Arc;

use chrono::Utc;
use fuschia_config::MessagePaths;
use fuschia_store::{CasOutcome, Store, WaitState, WaitStatus};
use fuschia_workflow::EventKind;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::{ResumeCoordinator, ResumeOutcome};
use crate::error::AwaitError;
use crate::evaluator::wait_satisfied;
use crate::path::first_match;

/// Why an inbound event was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
  MissingExecutionId,
  MissingCorrelationId,
  /// No `Waiting` state holds the correlation id. Covers late, duplicate
  /// and unrelated deliveries.
  NoWaitingState,
  /// The correlation id belongs to a different execution.
  Contamination,
  /// The wait state does not listen for this event kind.
  KindNotEnabled,
  /// This event kind was already recorded.
  Duplicate,
  /// Concurrent writers kept winning until the retry budget ran out.
  ContentionExhausted,
}

/// What ingestion did with an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum IngestOutcome {
  Dropped(DropReason),
  /// Stored; the wait is not satisfied yet.
  Recorded,
  /// Stored, satisfied, and handed to the resume coordinator.
  Resumed(ResumeOutcome),
}

pub struct EventRouter {
  store: Arc<dyn Store>,
  coordinator: Arc<ResumeCoordinator>,
  paths: MessagePaths,
  cas_retries: u32,
}

impl EventRouter {
  pub fn new(
    store: Arc<dyn Store>,
    coordinator: Arc<ResumeCoordinator>,
    paths: MessagePaths,
    cas_retries: u32,
  ) -> Self {
    Self {
      store,
      coordinator,
      paths,
      cas_retries,
    }
  }

  /// An HTTP callback addressed by (execution id, correlation id).
  pub async fn handle_api_response(
    &self,
    execution_id: &str,
    correlation_id: &str,
    payload: Value,
  ) -> Result<IngestOutcome, AwaitError> {
    self
      .ingest(EventKind::ApiResponse, execution_id, correlation_id, payload)
      .await
  }

  /// A message-bus record. The ids are read out of the payload using the
  /// configured lookup paths.
  pub async fn handle_message_event(
    &self,
    topic: &str,
    payload: Value,
  ) -> Result<IngestOutcome, AwaitError> {
    let execution_id = first_match(&payload, &self.paths.execution_id).unwrap_or_default();
    let correlation_id = first_match(&payload, &self.paths.correlation_id).unwrap_or_default();
    debug!(topic, %execution_id, %correlation_id, "message_event_received");
    self
      .ingest(EventKind::MessageEvent, &execution_id, &correlation_id, payload)
      .await
  }

  #[instrument(skip(self, payload), fields(kind = %kind))]
  async fn ingest(
    &self,
    kind: EventKind,
    execution_id: &str,
    correlation_id: &str,
    payload: Value,
  ) -> Result<IngestOutcome, AwaitError> {
    if execution_id.is_empty() {
      return Ok(dropped(DropReason::MissingExecutionId));
    }
    if correlation_id.is_empty() {
      return Ok(dropped(DropReason::MissingCorrelationId));
    }

    let Some(mut current) = self
      .store
      .find_waiting_by_correlation(correlation_id)
      .await?
    else {
      return Ok(dropped(DropReason::NoWaitingState));
    };

    let mut attempts = 0;
    let written = loop {
      if let Some(reason) = reject(&current, kind, execution_id) {
        return Ok(dropped(reason));
      }

      let mut next = current.clone();
      let expected = next.advance(Utc::now());
      next.record_event(kind, payload.clone());

      match self.store.cas_wait_state(expected, &next).await? {
        CasOutcome::Applied => break next,
        CasOutcome::NotFound => return Ok(dropped(DropReason::NoWaitingState)),
        CasOutcome::VersionConflict { actual } => {
          attempts += 1;
          if attempts > self.cas_retries {
            error!(
              wait_state_id = %current.id,
              attempts,
              "event_dropped_contention_exhausted"
            );
            return Ok(IngestOutcome::Dropped(DropReason::ContentionExhausted));
          }
          debug!(expected, actual, attempts, "event_write_conflict_retrying");
          match self.store.get_wait_state(&current.id).await? {
            Some(fresh) => current = fresh,
            None => return Ok(dropped(DropReason::NoWaitingState)),
          }
        }
      }
    };

    info!(
      wait_state_id = %written.id,
      received = ?written.received_events.0,
      "event_recorded"
    );

    if !wait_satisfied(&written) {
      return Ok(IngestOutcome::Recorded);
    }
    let outcome = self
      .coordinator
      .try_resume(&written.execution_id, &written.node_id)
      .await?;
    Ok(IngestOutcome::Resumed(outcome))
  }
}

/// Checks a candidate record against the inbound event. Runs again after
/// every conflict, against the freshly read record.
fn reject(state: &WaitState, kind: EventKind, execution_id: &str) -> Option<DropReason> {
  if state.status != WaitStatus::Waiting {
    return Some(DropReason::NoWaitingState);
  }
  if state.execution_id != execution_id {
    warn!(
      claimed_execution_id = execution_id,
      owning_execution_id = %state.execution_id,
      correlation_id = %state.correlation_id,
      "event_contamination_rejected"
    );
    return Some(DropReason::Contamination);
  }
  if !state.is_enabled(kind) {
    warn!(
      wait_state_id = %state.id,
      %kind,
      enabled = ?state.enabled_events.0,
      "event_kind_not_enabled"
    );
    return Some(DropReason::KindNotEnabled);
  }
  if state.has_received(kind) {
    return Some(DropReason::Duplicate);
  }
  None
}

fn dropped(reason: DropReason) -> IngestOutcome {
  debug!(?reason, "event_dropped");
  IngestOutcome::Dropped(reason)
}
