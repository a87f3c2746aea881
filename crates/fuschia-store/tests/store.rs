//! Behaviour shared by every `Store` backend.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use fuschia_store::{
  AttemptError, CasOutcome, Error, ExecutionRecord, ExecutionStatus, MemoryStore, RetryContext,
  RetrySchedule, RetryStatus, RetryType, SqliteStore, Store, WaitState, WaitStatus,
};
use fuschia_workflow::{AggregationStrategy, EventKind, OnTimeout, RetryPolicy};
use serde_json::json;
use sqlx::types::Json;

fn t0() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

fn wait_state(execution_id: &str, node_id: &str, created_at: DateTime<Utc>) -> WaitState {
  WaitState {
    id: uuid::Uuid::new_v4().to_string(),
    execution_id: execution_id.to_string(),
    node_id: node_id.to_string(),
    correlation_id: uuid::Uuid::new_v4().to_string(),
    aggregation_strategy: AggregationStrategy::All,
    enabled_events: Json(vec![EventKind::ApiResponse, EventKind::MessageEvent]),
    required_events: Json(vec![EventKind::ApiResponse, EventKind::MessageEvent]),
    on_timeout: OnTimeout::Fail,
    received_events: Json(Vec::new()),
    api_response_data: None,
    message_event_data: None,
    status: WaitStatus::Waiting,
    version: 1,
    resumed_at: None,
    resumed_by: None,
    failure: None,
    claimed_by: None,
    claimed_until: None,
    created_at,
    updated_at: created_at,
    expires_at: created_at + Duration::seconds(300),
  }
}

fn schedule(execution_id: &str, status: RetryStatus, at: DateTime<Utc>) -> RetrySchedule {
  RetrySchedule {
    id: uuid::Uuid::new_v4().to_string(),
    retry_type: RetryType::Execution,
    target_id: execution_id.to_string(),
    execution_id: execution_id.to_string(),
    node_id: None,
    policy: Json(RetryPolicy::default()),
    current_attempt: 0,
    scheduled_at: at,
    last_retried_at: None,
    status,
    retry_context: Json(RetryContext::Execution {
      trigger_data: json!({"order": 1}),
    }),
    error_history: Json(Vec::new()),
    version: 1,
    created_at: at,
    updated_at: at,
  }
}

async fn backends() -> Vec<(&'static str, Arc<dyn Store>)> {
  let sqlite = SqliteStore::in_memory().await.unwrap();
  vec![
    ("memory", Arc::new(MemoryStore::new()) as Arc<dyn Store>),
    ("sqlite", Arc::new(sqlite) as Arc<dyn Store>),
  ]
}

#[tokio::test]
async fn test_execution_round_trip() {
  for (name, store) in backends().await {
    let mut exec = ExecutionRecord::new("exec-1", "wf-1", t0());
    exec.trigger_data = Json(json!({"user": "ada"}));
    store.create_execution(&exec).await.unwrap();

    store
      .save_node_output("exec-1", "fetch", &json!({"rows": 3}))
      .await
      .unwrap();
    store
      .update_execution_status("exec-1", ExecutionStatus::Succeeded, Some(t0()))
      .await
      .unwrap();

    let loaded = store.get_execution("exec-1").await.unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Succeeded, "{name}");
    assert_eq!(loaded.node_outputs.0["fetch"], json!({"rows": 3}), "{name}");
    assert_eq!(loaded.trigger_data.0, json!({"user": "ada"}), "{name}");

    assert!(
      matches!(store.get_execution("missing").await, Err(Error::NotFound(_))),
      "{name}"
    );
  }
}

#[tokio::test]
async fn test_only_one_waiting_state_per_node() {
  for (name, store) in backends().await {
    let first = wait_state("exec-1", "approve", t0());
    store.insert_wait_state(&first).await.unwrap();

    let second = wait_state("exec-1", "approve", t0() + Duration::seconds(1));
    let err = store.insert_wait_state(&second).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{name}: {err}");

    // Once the first is terminal a new wait may be registered.
    let mut done = first.clone();
    let expected = done.advance(t0());
    done.status = WaitStatus::Completed;
    assert_eq!(
      store.cas_wait_state(expected, &done).await.unwrap(),
      CasOutcome::Applied,
      "{name}"
    );
    store.insert_wait_state(&second).await.unwrap();

    let latest = store
      .find_latest_wait_state("exec-1", "approve")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(latest.id, second.id, "{name}");
  }
}

#[tokio::test]
async fn test_cas_wait_state_rejects_stale_version() {
  for (name, store) in backends().await {
    let wait = wait_state("exec-1", "approve", t0());
    store.insert_wait_state(&wait).await.unwrap();

    let mut a = wait.clone();
    let expected_a = a.advance(t0());
    a.record_event(EventKind::ApiResponse, json!({"ok": true}));

    let mut b = wait.clone();
    let expected_b = b.advance(t0());
    b.record_event(EventKind::MessageEvent, json!({"ok": false}));

    assert_eq!(
      store.cas_wait_state(expected_a, &a).await.unwrap(),
      CasOutcome::Applied,
      "{name}"
    );
    assert_eq!(
      store.cas_wait_state(expected_b, &b).await.unwrap(),
      CasOutcome::VersionConflict { actual: 2 },
      "{name}"
    );

    let stored = store.get_wait_state(&wait.id).await.unwrap().unwrap();
    assert_eq!(stored.received_events.0, vec![EventKind::ApiResponse], "{name}");
    assert_eq!(stored.api_response_data.unwrap().0, json!({"ok": true}), "{name}");

    let mut ghost = wait_state("exec-9", "nope", t0());
    let expected = ghost.advance(t0());
    assert_eq!(
      store.cas_wait_state(expected, &ghost).await.unwrap(),
      CasOutcome::NotFound,
      "{name}"
    );
  }
}

#[tokio::test]
async fn test_find_waiting_by_correlation_ignores_terminal() {
  for (name, store) in backends().await {
    let wait = wait_state("exec-1", "approve", t0());
    store.insert_wait_state(&wait).await.unwrap();
    let found = store
      .find_waiting_by_correlation(&wait.correlation_id)
      .await
      .unwrap();
    assert_eq!(found.map(|w| w.id), Some(wait.id.clone()), "{name}");

    let mut timed_out = wait.clone();
    let expected = timed_out.advance(t0());
    timed_out.status = WaitStatus::Timeout;
    store.cas_wait_state(expected, &timed_out).await.unwrap();

    let found = store
      .find_waiting_by_correlation(&wait.correlation_id)
      .await
      .unwrap();
    assert!(found.is_none(), "{name}");
  }
}

#[tokio::test]
async fn test_expired_waiting_and_claims() {
  for (name, store) in backends().await {
    let early = wait_state("exec-1", "a", t0() - Duration::seconds(600));
    let late = wait_state("exec-1", "b", t0());
    store.insert_wait_state(&early).await.unwrap();
    store.insert_wait_state(&late).await.unwrap();

    let expired = store.find_expired_waiting(t0(), 10).await.unwrap();
    assert_eq!(
      expired.iter().map(|w| w.id.as_str()).collect::<Vec<_>>(),
      vec![early.id.as_str()],
      "{name}"
    );

    let ttl = Duration::seconds(120);
    let claimed = store
      .claim_wait_state(&early.id, "sweeper-a", t0(), ttl)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(claimed.version, early.version + 1, "{name}");
    assert_eq!(claimed.claimed_by.as_deref(), Some("sweeper-a"), "{name}");

    let rival = store
      .claim_wait_state(&early.id, "sweeper-b", t0() + Duration::seconds(10), ttl)
      .await
      .unwrap();
    assert!(rival.is_none(), "{name}");

    // A lapsed lease can be taken over.
    let rival = store
      .claim_wait_state(&early.id, "sweeper-b", t0() + Duration::seconds(121), ttl)
      .await
      .unwrap();
    assert_eq!(
      rival.and_then(|w| w.claimed_by),
      Some("sweeper-b".to_string()),
      "{name}"
    );
  }
}

#[tokio::test]
async fn test_due_retry_schedules_and_cas() {
  for (name, store) in backends().await {
    let due = schedule("exec-1", RetryStatus::Pending, t0() - Duration::seconds(5));
    let future = schedule("exec-2", RetryStatus::Pending, t0() + Duration::seconds(60));
    let done = schedule("exec-3", RetryStatus::Completed, t0() - Duration::seconds(5));
    for s in [&due, &future, &done] {
      store.insert_retry_schedule(s).await.unwrap();
    }

    let found = store.find_due_retry_schedules(t0(), 10).await.unwrap();
    assert_eq!(found.len(), 1, "{name}");
    assert_eq!(found[0].id, due.id, "{name}");

    let mut next = due.clone();
    let expected = next.advance(t0());
    next.status = RetryStatus::Scheduled;
    next.error_history.0.push(AttemptError {
      attempt: 1,
      timestamp: t0(),
      message: "boom".to_string(),
      error_type: "Error".to_string(),
    });
    assert!(store.cas_retry_schedule(expected, &next).await.unwrap().is_applied());
    assert_eq!(
      store.cas_retry_schedule(expected, &next).await.unwrap(),
      CasOutcome::VersionConflict { actual: 2 },
      "{name}"
    );

    let stored = store.get_retry_schedule(&due.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RetryStatus::Scheduled, "{name}");
    assert_eq!(stored.error_history.0.len(), 1, "{name}");
    assert_eq!(stored.policy.0, RetryPolicy::default(), "{name}");
  }
}

#[tokio::test]
async fn test_stale_and_archive() {
  for (name, store) in backends().await {
    let old = t0() - Duration::days(40);
    let stale = schedule("exec-1", RetryStatus::Retrying, old);
    let finished = schedule("exec-2", RetryStatus::Failed, old);
    let recent = schedule("exec-3", RetryStatus::Completed, t0());
    for s in [&stale, &finished, &recent] {
      store.insert_retry_schedule(s).await.unwrap();
    }

    let cutoff = t0() - Duration::days(30);
    let found = store
      .find_stale_active_retry_schedules(cutoff, 10)
      .await
      .unwrap();
    assert_eq!(
      found.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
      vec![stale.id.as_str()],
      "{name}"
    );

    let moved = store.archive_terminal_retry_schedules(cutoff).await.unwrap();
    assert_eq!(moved, 1, "{name}");
    assert!(store.get_retry_schedule(&finished.id).await.unwrap().is_none(), "{name}");
    assert!(store.get_retry_schedule(&recent.id).await.unwrap().is_some(), "{name}");
    assert!(store.get_retry_schedule(&stale.id).await.unwrap().is_some(), "{name}");
  }
}
