//! Fuschia Config
//!
//! This crate contains the serializable configuration types read by the
//! coordination layer. These types represent configuration exactly as it is
//! written in workflow node definitions and in the service config file, before
//! it is validated and resolved into typed policies by `fuschia-workflow`.
//!
//! Configuration can be loaded from:
//! - Node definitions (the `wait` and `retry` blocks, as JSON)
//! - A service config file (via CLI with `--config=coordinator.json`)
//!
//! Every field is optional or defaulted so that partially written blocks still
//! deserialize; defaults and fallbacks are applied during resolution.

mod retry;
mod service;
mod wait;

pub use retry::{CustomDelay, RetryBlock};
pub use service::{MessagePaths, ServiceConfig};
pub use wait::{EventSourceConfig, WaitBlock};
