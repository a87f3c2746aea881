//! Fuschia Retry
//!
//! Re-runs failed nodes and executions on a backoff schedule.
//!
//! ```text
//!  failure ──▶ RetryScheduler::create_* ──▶ store (Pending)
//!                                              │
//!  RetryDispatcher ──▶ dispatch_due ──▶ execute ──▶ RetryExecutor ──▶ NodeExecutor / Engine
//!                                              │
//!                        Completed | Pending (next_retry_at) | Failed (max attempts)
//!
//!  Cleanup ──▶ fail stale active schedules, archive old terminal ones
//! ```
//!
//! Every state change is a version-checked write, so several instances can
//! dispatch from the same store without running an attempt twice.

mod cache;
mod cleanup;
mod error;
mod executor;
mod scheduler;
mod strategy;

pub use cache::ContextCache;
pub use cleanup::{ABANDONED, Cleanup, CleanupConfig, CleanupReport};
pub use error::RetryError;
pub use executor::{AttemptResult, CONTEXT_UNAVAILABLE, RetryExecutor};
pub use scheduler::{DispatchReport, Executed, NodeSnapshot, RetryDispatcher, RetryScheduler};
pub use strategy::{DEFAULT_CUSTOM_DELAY, MAX_DELAY, delay_for, next_retry_at};
