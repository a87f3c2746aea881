use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
  #[error("unknown event kind: {0}")]
  UnknownEventKind(String),

  #[error("unknown aggregation strategy: {0}")]
  UnknownAggregationStrategy(String),

  #[error("unknown timeout policy: {0}")]
  UnknownTimeoutPolicy(String),

  #[error("unknown retry strategy: {0}")]
  UnknownRetryStrategy(String),
}
