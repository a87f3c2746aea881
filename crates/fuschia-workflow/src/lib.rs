//! Fuschia Workflow
//!
//! This crate provides the "locked" policy representation used by the
//! coordination layer. A locked policy is the validated, resolved form of a
//! node's `wait` or `retry` block, produced once when a wait state or retry
//! schedule is created and then stored alongside it.
//!
//! Key differences from `fuschia-config`:
//! - Strategy names are closed enums, matched exhaustively
//! - Defaults are applied (timeout, max attempts, strategy parameters)
//! - Derived sets are computed up front (enabled and required event kinds)
//! - Unknown names never fail resolution; they fall back with a warning

mod error;
mod event;
mod retry;
mod wait;

pub use error::PolicyError;
pub use event::EventKind;
pub use retry::{
  Backoff, DEFAULT_EXPONENTIAL_INITIAL_DELAY_SECS, DEFAULT_EXPONENTIAL_MULTIPLIER,
  DEFAULT_FIXED_DELAY_SECS, DEFAULT_MAX_ATTEMPTS, RetryPolicy,
};
pub use wait::{AggregationStrategy, DEFAULT_WAIT_TIMEOUT_SECS, OnTimeout, WaitPolicy};
