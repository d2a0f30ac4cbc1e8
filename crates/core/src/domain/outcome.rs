// Handler Outcome

use serde::{Deserialize, Serialize};

/// Result of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Transient failure: retried with backoff until the attempt budget is spent
    RetryableFailure(String),
    /// Validation-style failure the handler knows will not go away
    PermanentFailure(String),
}

impl Outcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Outcome::RetryableFailure(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Outcome::PermanentFailure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::RetryableFailure(reason) | Outcome::PermanentFailure(reason) => Some(reason),
        }
    }
}
