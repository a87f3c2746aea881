use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// The kinds of external signal a wait state can collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
  /// An HTTP callback delivered to the api-response endpoint.
  ApiResponse,
  /// A record consumed from a message bus.
  MessageEvent,
}

impl EventKind {
  pub const ALL: [EventKind; 2] = [EventKind::ApiResponse, EventKind::MessageEvent];

  pub fn as_str(&self) -> &'static str {
    match self {
      EventKind::ApiResponse => "api_response",
      EventKind::MessageEvent => "message_event",
    }
  }
}

impl fmt::Display for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EventKind {
  type Err = PolicyError;

  /// Accepts the canonical names plus the config-side source names
  /// (`api_call`, `apiCall`, `messageEvent`).
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "api_response" | "api_call" | "apiCall" | "apiResponse" => Ok(EventKind::ApiResponse),
      "message_event" | "messageEvent" => Ok(EventKind::MessageEvent),
      other => Err(PolicyError::UnknownEventKind(other.to_string())),
    }
  }
}
