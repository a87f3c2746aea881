//! Timeout sweeping.

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{
  EXECUTION_ID, Harness, NODE_ID, RejectingEngine, api_only_block, channel_engine, drain,
  wait_block,
};
use fuschia_await::{IngestOutcome, SweepReport, TIMEOUT_MESSAGE};
use fuschia_engine::EngineCall;
use fuschia_store::{Store, WaitState, WaitStatus};
use fuschia_workflow::EventKind;
use serde_json::json;
use tokio::sync::mpsc;

fn after_expiry(wait: &WaitState) -> DateTime<Utc> {
  wait.expires_at + Duration::seconds(1)
}

async fn record_api_response(h: &Harness, wait: &WaitState) {
  let outcome = h
    .router
    .handle_api_response(EXECUTION_ID, &wait.correlation_id, json!({"status": "approved"}))
    .await
    .unwrap();
  assert_eq!(outcome, IngestOutcome::Recorded);
}

#[tokio::test]
async fn test_fail_policy_times_out_and_reports() {
  let (engine, mut calls) = channel_engine();
  let h = Harness::new(engine).await;
  let wait = h.register(&wait_block("ALL", "FAIL")).await;

  // Not yet expired.
  let report = h.sweeper.sweep_once(Utc::now()).await.unwrap();
  assert_eq!(report, SweepReport::default());

  let now = after_expiry(&wait);
  let report = h.sweeper.sweep_once(now).await.unwrap();
  assert_eq!(report.expired, 1);
  assert_eq!(report.timed_out, 1);

  let swept = h.reload(&wait).await;
  assert_eq!(swept.status, WaitStatus::Timeout);
  assert_eq!(swept.failure.as_deref(), Some(TIMEOUT_MESSAGE));
  assert_eq!(swept.resumed_by.as_deref(), Some("instance-a"));
  assert_eq!(swept.resumed_at, Some(now));
  assert!(swept.claimed_by.is_none());

  let calls = drain(&mut calls);
  assert_eq!(calls.len(), 1);
  let EngineCall::ReportFailure(report) = &calls[0] else {
    panic!("expected a failure report, got {:?}", calls[0]);
  };
  assert_eq!(report.execution_id, EXECUTION_ID);
  assert_eq!(report.node_id.as_deref(), Some(NODE_ID));
  assert_eq!(report.message, TIMEOUT_MESSAGE);
  assert_eq!(report.elapsed_ms, Some((now - wait.created_at).num_milliseconds()));

  // Terminal records are never swept again.
  let report = h.sweeper.sweep_once(now).await.unwrap();
  assert_eq!(report.expired, 0);
}

#[tokio::test]
async fn test_continue_with_unmet_all_times_out() {
  let (engine, mut calls) = channel_engine();
  let h = Harness::new(engine).await;
  let wait = h.register(&wait_block("ALL", "CONTINUE")).await;
  record_api_response(&h, &wait).await;

  let report = h.sweeper.sweep_once(after_expiry(&wait)).await.unwrap();
  assert_eq!(report.timed_out, 1);
  assert_eq!(h.reload(&wait).await.status, WaitStatus::Timeout);
  assert!(matches!(
    drain(&mut calls).as_slice(),
    [EngineCall::ReportFailure(_)]
  ));
}

#[tokio::test]
async fn test_continue_with_partial_resumes_with_what_arrived() {
  let (engine, mut calls) = channel_engine();
  let h = Harness::new(engine).await;
  let wait = h.register(&wait_block("ALL", "CONTINUE_WITH_PARTIAL")).await;
  record_api_response(&h, &wait).await;

  let report = h.sweeper.sweep_once(after_expiry(&wait)).await.unwrap();
  assert_eq!(report.resumed, 1);
  assert_eq!(h.reload(&wait).await.status, WaitStatus::Completed);

  let calls = drain(&mut calls);
  let [EngineCall::Resume { payload, .. }] = calls.as_slice() else {
    panic!("expected one resume, got {calls:?}");
  };
  assert_eq!(payload["partial"], true);
  assert_eq!(payload["api_response"], json!({"status": "approved"}));
  assert!(payload.get("message_event").is_none());
  assert_eq!(payload["received_events"], json!(["api_response"]));
}

#[tokio::test]
async fn test_continue_with_partial_and_nothing_received_times_out() {
  let (engine, _calls) = channel_engine();
  let h = Harness::new(engine).await;
  let wait = h.register(&wait_block("ALL", "CONTINUE_WITH_PARTIAL")).await;

  let report = h.sweeper.sweep_once(after_expiry(&wait)).await.unwrap();
  assert_eq!(report.timed_out, 1);
  assert_eq!(h.reload(&wait).await.status, WaitStatus::Timeout);
}

#[tokio::test]
async fn test_disabled_kind_on_record_does_not_count_as_partial() {
  let (engine, mut calls) = channel_engine();
  let h = Harness::new(engine).await;
  let wait = h.register(&api_only_block("ALL", "CONTINUE_WITH_PARTIAL")).await;

  // A record carrying a kind it never listened for, written before
  // ingestion rejected such events.
  let mut stored = h.reload(&wait).await;
  let expected = stored.advance(Utc::now());
  stored.record_event(EventKind::MessageEvent, json!({"ok": true}));
  assert!(
    h.store
      .cas_wait_state(expected, &stored)
      .await
      .unwrap()
      .is_applied()
  );

  let report = h.sweeper.sweep_once(after_expiry(&wait)).await.unwrap();
  assert_eq!(report.timed_out, 1);
  assert_eq!(report.resumed, 0);
  assert_eq!(h.reload(&wait).await.status, WaitStatus::Timeout);
  assert!(matches!(
    drain(&mut calls).as_slice(),
    [EngineCall::ReportFailure(_)]
  ));
}

#[tokio::test]
async fn test_continue_when_policy_already_met() {
  let (engine, mut calls) = channel_engine();
  let h = Harness::new(engine).await;
  let wait = h.register(&wait_block("ANY", "CONTINUE")).await;

  // The event was stored but the instance that stored it died before
  // resuming, so the wait is satisfied yet still parked.
  let mut stored = h.reload(&wait).await;
  let expected = stored.advance(Utc::now());
  stored.record_event(EventKind::MessageEvent, json!({"ok": true}));
  assert!(
    h.store
      .cas_wait_state(expected, &stored)
      .await
      .unwrap()
      .is_applied()
  );

  let report = h.sweeper.sweep_once(after_expiry(&wait)).await.unwrap();
  assert_eq!(report.resumed, 1);
  assert_eq!(h.reload(&wait).await.status, WaitStatus::Completed);

  let calls = drain(&mut calls);
  let [EngineCall::Resume { payload, .. }] = calls.as_slice() else {
    panic!("expected one resume, got {calls:?}");
  };
  assert_eq!(payload["partial"], true);
  assert_eq!(payload["message_event"], json!({"ok": true}));
}

#[tokio::test]
async fn test_engine_failure_on_continue_marks_failed() {
  let (reports, mut report_rx) = mpsc::unbounded_channel();
  let h = Harness::new(Arc::new(RejectingEngine { reports })).await;
  let wait = h.register(&wait_block("ALL", "CONTINUE_WITH_PARTIAL")).await;
  record_api_response(&h, &wait).await;

  let report = h.sweeper.sweep_once(after_expiry(&wait)).await.unwrap();
  assert_eq!(report.failed, 1);

  let swept = h.reload(&wait).await;
  assert_eq!(swept.status, WaitStatus::Failed);
  assert_eq!(swept.failure.as_deref(), Some("node crashed on resume"));
  assert!(report_rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_claimed_record_is_skipped_by_other_instances() {
  let (engine, mut calls) = channel_engine();
  let a = Harness::new(engine.clone()).await;
  let b = Harness::sharing(a.store.clone(), engine, "instance-b");
  let wait = a.register(&wait_block("ALL", "FAIL")).await;
  let now = after_expiry(&wait);

  // Instance b holds a live lease.
  b.store
    .claim_wait_state(&wait.id, "instance-b", now, Duration::seconds(120))
    .await
    .unwrap()
    .unwrap();

  let report = a.sweeper.sweep_once(now).await.unwrap();
  assert_eq!(report.skipped, 1);
  assert_eq!(a.reload(&wait).await.status, WaitStatus::Waiting);
  assert!(drain(&mut calls).is_empty());

  // The lease holder completes it.
  let report = b.sweeper.sweep_once(now).await.unwrap();
  assert_eq!(report.timed_out, 1);
  assert_eq!(drain(&mut calls).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_sweepers_report_once() {
  let (engine, mut calls) = channel_engine();
  let a = Harness::new(engine.clone()).await;
  let wait = a.register(&wait_block("ALL", "FAIL")).await;
  let now = after_expiry(&wait);

  let sweepers: Vec<Harness> = (0..4)
    .map(|i| Harness::sharing(a.store.clone(), engine.clone(), &format!("sweeper-{i}")))
    .collect();
  let runs = sweepers.iter().map(|h| h.sweeper.sweep_once(now));
  let reports = futures::future::join_all(runs).await;

  let timed_out: usize = reports.into_iter().map(|r| r.unwrap().timed_out).sum();
  assert_eq!(timed_out, 1);
  assert_eq!(drain(&mut calls).len(), 1);
}
