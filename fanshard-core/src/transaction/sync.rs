use serde::{Deserialize, Serialize};

use crate::error::BoxError;

/// Outcome reported to [`Synchronization::after_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Committed,
    RolledBack,
    /// Some native transactions may have committed and others not.
    Unknown,
}

/// Callback around the completion of a logical transaction.
///
/// Errors and panics raised here are logged and never abort a commit or a
/// rollback.
pub trait Synchronization: Send + Sync {
    /// Runs once before the first native commit.
    fn before_completion(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_completion(&self, status: CompletionStatus) -> Result<(), BoxError>;
}
