// ABOUTME: Persistence interface for tasks, backup policies, backups and databases
// ABOUTME: The engine only talks to storage through this trait

mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Backup, BackupId, BackupPolicy, CancellationType, DatabaseId, NewBackup, NewBackupPolicy,
    PolicyId, TargetDatabase, Task, TaskId, TaskProgress, TaskState, TaskType,
};

/// CRUD surface the engine needs from the record store.
///
/// Implementations must make [`Store::insert_task_if_idle`] atomic: the
/// check for an incomplete task on the database and the insert of the new
/// one happen as a single step.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_database(
        &self,
        name: &str,
        connection_string: &str,
        database_name: &str,
    ) -> Result<TargetDatabase>;

    async fn get_database(&self, id: DatabaseId) -> Result<Option<TargetDatabase>>;

    async fn list_databases(&self) -> Result<Vec<TargetDatabase>>;

    /// Insert a running task unless the database already has an incomplete one.
    async fn insert_task_if_idle(
        &self,
        database_id: DatabaseId,
        task_type: TaskType,
        progress: &TaskProgress,
    ) -> Result<Option<Task>>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Most recently started tasks first.
    async fn list_tasks(&self, limit: usize) -> Result<Vec<Task>>;

    async fn find_incomplete_tasks(&self, database_id: DatabaseId) -> Result<Vec<Task>>;

    async fn update_task_progress(&self, id: TaskId, progress: &TaskProgress) -> Result<()>;

    async fn set_cancellation_type(
        &self,
        id: TaskId,
        cancellation_type: CancellationType,
    ) -> Result<()>;

    async fn request_cancel(&self, id: TaskId) -> Result<()>;

    /// Record the terminal state, progress and completion time in one update.
    async fn complete_task(
        &self,
        id: TaskId,
        state: TaskState,
        progress: &TaskProgress,
    ) -> Result<()>;

    /// Complete every task still marked running with an error. Returns how many were touched.
    async fn fail_interrupted_tasks(&self, progress: &TaskProgress) -> Result<usize>;

    async fn insert_policy(&self, policy: &NewBackupPolicy) -> Result<BackupPolicy>;

    async fn get_policy(&self, id: PolicyId) -> Result<Option<BackupPolicy>>;

    async fn list_policies(&self) -> Result<Vec<BackupPolicy>>;

    async fn delete_policy(&self, id: PolicyId) -> Result<()>;

    async fn set_policy_active_task(&self, id: PolicyId, task_id: Option<TaskId>) -> Result<()>;

    async fn record_policy_run(&self, id: PolicyId, at: DateTime<Utc>) -> Result<()>;

    async fn set_policy_next_run(&self, id: PolicyId, at: Option<DateTime<Utc>>) -> Result<()>;

    async fn insert_backup(&self, backup: &NewBackup) -> Result<Backup>;

    async fn get_backup(&self, id: BackupId) -> Result<Option<Backup>>;

    async fn list_backups(&self) -> Result<Vec<Backup>>;

    async fn list_backups_for_policy(&self, policy_id: PolicyId) -> Result<Vec<Backup>>;

    async fn delete_backup(&self, id: BackupId) -> Result<()>;
}
