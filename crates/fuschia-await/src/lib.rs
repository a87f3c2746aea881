//! Fuschia Await
//!
//! Lets a node park until external events arrive and resumes it exactly once,
//! no matter how many coordinator instances see those events.
//!
//! ```text
//!  callback / message ──▶ EventRouter ──▶ evaluator ──▶ ResumeCoordinator ──▶ Engine
//!                              ▲                              ▲
//!  ConsumerRegistry ───────────┘       TimeoutSweeper ────────┘
//! ```
//!
//! The only synchronization is the store's version-checked write. Losing a
//! race is an outcome, not an error.

mod consumer;
mod coordinator;
mod error;
mod evaluator;
mod path;
mod registry;
mod router;
mod sweeper;

pub use consumer::{
  ChannelConsumer, Consumer, ConsumerRegistry, InboundMessage, JsonLinesConsumer, TransportKind,
};
pub use coordinator::{ResumeCoordinator, ResumeOutcome, aggregate};
pub use error::AwaitError;
pub use evaluator::{is_satisfied, wait_satisfied};
pub use path::{first_match, lookup_path};
pub use registry::WaitRegistry;
pub use router::{DropReason, EventRouter, IngestOutcome};
pub use sweeper::{SweepReport, SweeperConfig, TIMEOUT_MESSAGE, TimeoutSweeper};
