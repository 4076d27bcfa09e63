// ABOUTME: Deletes backup records together with their archive files
// ABOUTME: Also clears any retention timer armed for a deleted backup

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ExecutionOutcome, TaskCommands, TaskExecutor};
use crate::engine::EngineContext;
use crate::models::{BackupId, CancellationType, TargetDatabaseAccess, TaskProgress};

pub struct DeleteBackupExecutor {
    ctx: Arc<EngineContext>,
    backup_ids: Vec<BackupId>,
}

impl DeleteBackupExecutor {
    pub fn new(ctx: Arc<EngineContext>, backup_ids: Vec<BackupId>) -> Self {
        Self { ctx, backup_ids }
    }
}

#[async_trait]
impl TaskExecutor for DeleteBackupExecutor {
    async fn execute(
        &self,
        commands: &TaskCommands,
        _target: &TargetDatabaseAccess,
    ) -> Result<ExecutionOutcome> {
        commands
            .set_cancellation_type(CancellationType::NotCancellable)
            .await?;

        let deleted = delete_backups(&self.ctx, &self.backup_ids, Some(commands)).await?;
        let message = match deleted {
            1 => "Deleted 1 backup".to_string(),
            n => format!("Deleted {} backups", n),
        };
        Ok(ExecutionOutcome::successful(message))
    }
}

/// Delete each backup's record, its retention timer, then its archive.
///
/// Ids that no longer exist are skipped. An archive that is already gone
/// is not an error. Returns the number of records removed.
pub async fn delete_backups(
    ctx: &EngineContext,
    backup_ids: &[BackupId],
    commands: Option<&TaskCommands>,
) -> Result<usize> {
    let total = backup_ids.len() as u64;
    let mut deleted = 0;

    for (done, &backup_id) in backup_ids.iter().enumerate() {
        if let Some(commands) = commands {
            let progress =
                TaskProgress::detailed("Deleting backups", done as u64, total, "backups");
            commands.report_progress(progress);
        }

        let Some(backup) = ctx.store.get_backup(backup_id).await? else {
            debug!(backup_id, "backup already deleted");
            ctx.timers.clear_deletion(backup_id);
            continue;
        };

        ctx.store.delete_backup(backup_id).await?;
        ctx.timers.clear_deletion(backup_id);

        let path = &backup.archive_path;
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(backup_id, path = %path.display(), "backup archive was already missing");
            }
            Err(e) => {
                let context = format!("Failed to remove backup archive {}", path.display());
                return Err(e).context(context);
            }
        }

        info!(backup_id, path = %path.display(), "backup deleted");
        deleted += 1;
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Backup, BackupMode, NewBackup, SourceMetadata, TaskState, TaskType};
    use crate::tasks::test_support::{add_database, fake_tools, test_context};
    use crate::tasks::{Admission, TaskRunner};
    use chrono::Utc;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn backup_with_file(
        ctx: &EngineContext,
        database_id: i64,
        dir: &Path,
        name: &str,
    ) -> Backup {
        let archive_path = dir.join(name);
        std::fs::write(&archive_path, b"archive").unwrap();
        ctx.store
            .insert_backup(&NewBackup {
                database_id: Some(database_id),
                source: SourceMetadata {
                    database_name: "app".into(),
                    collections: Vec::new(),
                },
                archive_path,
                size_bytes: 7,
                mode: BackupMode::Compatible,
                policy_id: None,
                created_at: Utc::now(),
                finished_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_delete_task_removes_records_files_and_timers() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(dir.path(), fake_tools(dir.path()));
        let db = add_database(&ctx).await;
        let first = backup_with_file(&ctx, db.id, dir.path(), "a.archive.gz").await;
        let second = backup_with_file(&ctx, db.id, dir.path(), "b.archive.gz").await;
        let never = futures::future::ready(());
        let hour = Duration::from_secs(3600);
        ctx.timers.arm_deletion(first.id, hour, never);
        assert!(ctx.timers.deletion_armed(first.id));

        let runner = TaskRunner::new(ctx.store.clone());
        let ids = vec![first.id, second.id, 404];
        let executor = Box::new(DeleteBackupExecutor::new(ctx.clone(), ids));
        let Admission::Accepted { task_id, handle } = runner
            .start_task(db.id, TaskType::DeleteBackup, executor)
            .await
            .unwrap()
        else {
            panic!("delete should be accepted");
        };

        let completion = handle.wait().await.unwrap();
        assert_eq!(completion.state, TaskState::Successful);
        assert_eq!(completion.message, "Deleted 2 backups");
        assert!(ctx.store.list_backups().await.unwrap().is_empty());
        assert!(!first.archive_path.exists());
        assert!(!second.archive_path.exists());
        assert!(!ctx.timers.deletion_armed(first.id));

        let task = ctx.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.cancellation_type, CancellationType::NotCancellable);
    }

    #[tokio::test]
    async fn test_missing_archive_still_deletes_record() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(dir.path(), fake_tools(dir.path()));
        let db = add_database(&ctx).await;
        let backup = backup_with_file(&ctx, db.id, dir.path(), "gone.archive.gz").await;
        std::fs::remove_file(&backup.archive_path).unwrap();

        assert_eq!(delete_backups(&ctx, &[backup.id], None).await.unwrap(), 1);
        assert!(ctx.store.get_backup(backup.id).await.unwrap().is_none());
    }
}
