/// Errors surfaced to direct callers of the wait-state APIs.
///
/// Ingestion problems that are expected under concurrency (duplicates,
/// unknown correlation ids, contamination, lost races) are outcomes, not
/// errors. See [`crate::IngestOutcome`] and [`crate::ResumeOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum AwaitError {
  #[error("execution not found: {0}")]
  ExecutionNotFound(String),

  /// The node already has a wait state in `Waiting`.
  #[error("node {node_id} of execution {execution_id} is already waiting")]
  AlreadyWaiting {
    execution_id: String,
    node_id: String,
  },

  #[error("consumer already running: {0}")]
  ConsumerExists(String),

  #[error("consumer i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("store error: {0}")]
  Store(#[from] fuschia_store::Error),
}
