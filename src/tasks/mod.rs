// ABOUTME: Task lifecycle and the executors for each job kind
// ABOUTME: An executor drives the tools; the runner owns the task record around it

mod backup;
mod commands;
mod delete;
mod import;
mod restore;
mod runner;

#[cfg(test)]
pub(crate) mod test_support;

pub use backup::BackupExecutor;
pub use commands::{ProgressWriter, TaskCommands};
pub use delete::{delete_backups, DeleteBackupExecutor};
pub use import::ImportExecutor;
pub use restore::RestoreExecutor;
pub use runner::{Admission, CancelRequest, RejectReason, TaskCompletion, TaskHandle, TaskRunner};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{BackupId, TargetDatabaseAccess, TaskState};

/// Terminal result an executor hands back to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub state: TaskState,
    pub message: String,
    /// Backup record produced by the run, if any.
    pub backup_id: Option<BackupId>,
}

impl ExecutionOutcome {
    pub fn successful(message: impl Into<String>) -> Self {
        Self {
            state: TaskState::Successful,
            message: message.into(),
            backup_id: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: TaskState::Error,
            message: message.into(),
            backup_id: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            state: TaskState::Cancelled,
            message: message.into(),
            backup_id: None,
        }
    }

    pub fn with_backup(mut self, backup_id: BackupId) -> Self {
        self.backup_id = Some(backup_id);
        self
    }
}

/// One kind of job. Parameters live on the implementing type.
///
/// Returning `Err` wrapping [`crate::error::EngineError::Cancelled`] marks
/// the task cancelled; any other `Err` marks it failed with a generic
/// message while the error itself is only logged.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        commands: &TaskCommands,
        target: &TargetDatabaseAccess,
    ) -> Result<ExecutionOutcome>;
}
