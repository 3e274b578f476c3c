//! The event reference every command and event carries.

use crate::utils::{not_before, now_utc, Timestamp};
use serde::{Deserialize, Serialize};

/// Identifies the execution a log entry belongs to and when it was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Execution identifier, shared by every entry in one log.
    pub execution_id: String,
    /// Creation time.
    pub created_at: Timestamp,
}

impl Envelope {
    /// Creates the envelope that starts a causal chain.
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            created_at: now_utc(),
        }
    }

    /// Derives the envelope of a follow-up message: same execution, and a
    /// `created_at` never earlier than this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            execution_id: self.execution_id.clone(),
            created_at: not_before(now_utc(), self.created_at),
        }
    }
}
