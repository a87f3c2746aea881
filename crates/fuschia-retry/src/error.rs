/// Errors surfaced to direct callers of the retry APIs.
///
/// A replayed step failing is not an error here; it is recorded in the
/// schedule's error history.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
  #[error("execution not found: {0}")]
  ExecutionNotFound(String),

  #[error("store error: {0}")]
  Store(#[from] fuschia_store::Error),
}
