/// Error type returned by [`crate::Engine`] and [`crate::NodeExecutor`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
  /// The resumed or replayed step ran and failed.
  #[error("{message}")]
  Execution { message: String, error_type: String },

  /// The engine has no record of the execution.
  #[error("execution not found: {0}")]
  ExecutionNotFound(String),

  /// The engine could not be reached.
  #[error("engine unavailable: {0}")]
  Unavailable(String),
}

impl EngineError {
  pub fn execution(message: impl Into<String>) -> Self {
    Self::Execution {
      message: message.into(),
      error_type: "ExecutionError".to_string(),
    }
  }

  pub fn with_type(message: impl Into<String>, error_type: impl Into<String>) -> Self {
    Self::Execution {
      message: message.into(),
      error_type: error_type.into(),
    }
  }

  /// Machine-readable category recorded in retry error history.
  pub fn error_type(&self) -> &str {
    match self {
      Self::Execution { error_type, .. } => error_type,
      Self::ExecutionNotFound(_) => "ExecutionNotFound",
      Self::Unavailable(_) => "EngineUnavailable",
    }
  }
}
