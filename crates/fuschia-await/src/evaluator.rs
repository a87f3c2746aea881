//! Completion evaluation.
//!
//! Pure and monotonic: if a received set satisfies a wait, every superset of
//! it does too.

use fuschia_store::WaitState;
use fuschia_workflow::{AggregationStrategy, EventKind};

/// Whether `received` satisfies a wait configured with `strategy`.
pub fn is_satisfied(
  strategy: AggregationStrategy,
  enabled: &[EventKind],
  required: &[EventKind],
  received: &[EventKind],
) -> bool {
  let has_all = |wanted: &[EventKind]| wanted.iter().all(|k| received.contains(k));
  match strategy {
    AggregationStrategy::All => !enabled.is_empty() && has_all(enabled),
    AggregationStrategy::Any => received.iter().any(|k| enabled.contains(k)),
    AggregationStrategy::RequiredOnly | AggregationStrategy::Custom => {
      !required.is_empty() && has_all(required)
    }
  }
}

/// [`is_satisfied`] over a stored wait state.
pub fn wait_satisfied(state: &WaitState) -> bool {
  is_satisfied(
    state.aggregation_strategy,
    &state.enabled_events.0,
    &state.required_events.0,
    &state.received_events.0,
  )
}
