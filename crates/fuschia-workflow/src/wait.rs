use std::str::FromStr;

use fuschia_config::{EventSourceConfig, WaitBlock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PolicyError;
use crate::event::EventKind;

/// Applied when a wait block omits `timeoutSeconds`.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

/// Which combination of received event kinds satisfies a wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationStrategy {
  /// Every enabled event kind must arrive.
  #[default]
  All,
  /// Any one enabled event kind is enough.
  Any,
  /// Only the sources flagged `required` must arrive.
  RequiredOnly,
  /// An explicit list of event kinds must arrive.
  Custom,
}

impl FromStr for AggregationStrategy {
  type Err = PolicyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_uppercase().as_str() {
      "ALL" => Ok(Self::All),
      "ANY" => Ok(Self::Any),
      "REQUIRED_ONLY" => Ok(Self::RequiredOnly),
      "CUSTOM" => Ok(Self::Custom),
      _ => Err(PolicyError::UnknownAggregationStrategy(s.to_string())),
    }
  }
}

/// What the timeout sweeper does with an expired wait state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnTimeout {
  /// Fail the node.
  #[default]
  Fail,
  /// Resume if the completion policy is already met, otherwise fail.
  Continue,
  /// Resume with whatever arrived, as long as something did.
  ContinueWithPartial,
}

impl FromStr for OnTimeout {
  type Err = PolicyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_uppercase().as_str() {
      "FAIL" => Ok(Self::Fail),
      "CONTINUE" => Ok(Self::Continue),
      "CONTINUE_WITH_PARTIAL" => Ok(Self::ContinueWithPartial),
      _ => Err(PolicyError::UnknownTimeoutPolicy(s.to_string())),
    }
  }
}

/// A resolved wait block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
  pub strategy: AggregationStrategy,
  pub enabled_events: Vec<EventKind>,
  pub required_events: Vec<EventKind>,
  pub timeout_seconds: u64,
  pub on_timeout: OnTimeout,
}

impl WaitPolicy {
  /// Resolve a raw wait block.
  ///
  /// `required_events` is derived from the strategy: ALL copies the enabled
  /// set, ANY is empty, REQUIRED_ONLY takes the sources flagged `required`,
  /// and CUSTOM takes the explicit `requiredEvents` list.
  pub fn resolve(block: &WaitBlock) -> Self {
    let strategy = match block.aggregation_strategy.as_deref() {
      None => AggregationStrategy::default(),
      Some(name) => name.parse().unwrap_or_else(|e: PolicyError| {
        warn!(error = %e, "falling back to ALL aggregation");
        AggregationStrategy::All
      }),
    };

    let on_timeout = match block.on_timeout.as_deref() {
      None => OnTimeout::default(),
      Some(name) => name.parse().unwrap_or_else(|e: PolicyError| {
        warn!(error = %e, "falling back to FAIL on timeout");
        OnTimeout::Fail
      }),
    };

    let sources = [
      (EventKind::ApiResponse, block.api_call.as_ref()),
      (EventKind::MessageEvent, block.message_event.as_ref()),
    ];
    let enabled_events = select(&sources, |s| s.enabled);

    let required_events = match strategy {
      AggregationStrategy::All => enabled_events.clone(),
      AggregationStrategy::Any => Vec::new(),
      AggregationStrategy::RequiredOnly => select(&sources, |s| s.required),
      AggregationStrategy::Custom => parse_event_list(&block.required_events),
    };

    if enabled_events.is_empty() {
      warn!("wait block enables no event sources; it can only time out");
    }

    Self {
      strategy,
      enabled_events,
      required_events,
      timeout_seconds: block.timeout_seconds.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS),
      on_timeout,
    }
  }
}

fn select(
  sources: &[(EventKind, Option<&EventSourceConfig>)],
  pred: impl Fn(&EventSourceConfig) -> bool,
) -> Vec<EventKind> {
  sources
    .iter()
    .filter(|(_, source)| source.is_some_and(&pred))
    .map(|(kind, _)| *kind)
    .collect()
}

fn parse_event_list(names: &[String]) -> Vec<EventKind> {
  let mut kinds = Vec::with_capacity(names.len());
  for name in names {
    match name.parse::<EventKind>() {
      Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
      Ok(_) => {}
      Err(e) => warn!(error = %e, "ignoring entry in requiredEvents"),
    }
  }
  kinds
}
