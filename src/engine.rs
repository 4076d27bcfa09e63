// ABOUTME: Wires storage, tools, the task runner and the scheduler into one service
// ABOUTME: Entry points for starting jobs and managing backup policies

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::compression::CompressionNegotiator;
use crate::config::{Config, ToolsConfig};
use crate::error::EngineError;
use crate::inspect::{DatabaseInspector, MongoShellInspector};
use crate::models::{
    BackupId, BackupMode, BackupPolicy, DatabaseId, NewBackupPolicy, PolicyId, TaskId, TaskType,
};
use crate::process::ProcessRunner;
use crate::scheduler::{next_occurrence, ScheduleTimers, TaskScheduler};
use crate::store::{SqliteStore, Store};
use crate::tasks::{
    delete_backups, Admission, BackupExecutor, CancelRequest, DeleteBackupExecutor, ImportExecutor,
    RestoreExecutor, TaskRunner,
};

/// Shared collaborators handed to every executor.
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub processes: ProcessRunner,
    pub compression: CompressionNegotiator,
    pub inspector: Arc<dyn DatabaseInspector>,
    pub tools: ToolsConfig,
    pub backup_dir: PathBuf,
    pub timers: Arc<ScheduleTimers>,
}

/// Result of asking for a backup to be deleted.
pub enum Deletion {
    /// A delete task was admitted (or refused) for the backup's database.
    Task(Admission),
    /// The backup had no database left to run a task against and was removed directly.
    Immediate,
}

pub struct Engine {
    ctx: Arc<EngineContext>,
    runner: Arc<TaskRunner>,
    scheduler: Arc<TaskScheduler>,
}

impl Engine {
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = SqliteStore::open(&config.database_path)?;
        let processes = ProcessRunner::new(config.engine.cancellation_poll_interval());
        let inspector = MongoShellInspector::new(processes, config.tools.mongosh.clone());
        Ok(Self::new(Arc::new(store), Arc::new(inspector), config))
    }

    pub fn new(
        store: Arc<dyn Store>,
        inspector: Arc<dyn DatabaseInspector>,
        config: &Config,
    ) -> Self {
        let ctx = Arc::new(EngineContext {
            store: Arc::clone(&store),
            processes: ProcessRunner::new(config.engine.cancellation_poll_interval()),
            compression: CompressionNegotiator::new(config.tools.zstd.clone()),
            inspector,
            tools: config.tools.clone(),
            backup_dir: config.backup_dir.clone(),
            timers: Arc::new(ScheduleTimers::default()),
        });
        let runner = Arc::new(TaskRunner::new(store));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&ctx),
            Arc::clone(&runner),
            config.engine.conflict_backoff(),
        ));

        Self {
            ctx,
            runner,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.ctx.store
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Recover from a previous run: fail interrupted tasks, then re-arm every timer.
    pub async fn start(&self) -> Result<()> {
        self.runner.recover_interrupted().await?;
        self.scheduler.restore().await?;
        info!(backup_dir = %self.ctx.backup_dir.display(), "engine started");
        Ok(())
    }

    pub async fn start_backup(
        &self,
        database_id: DatabaseId,
        mode: BackupMode,
    ) -> Result<Admission> {
        let executor = BackupExecutor::manual(Arc::clone(&self.ctx), mode);
        self.runner
            .start_task(database_id, TaskType::ManualBackup, Box::new(executor))
            .await
    }

    /// Restore `backup_id` into `target`, or into the database it was taken from.
    pub async fn start_restore(
        &self,
        backup_id: BackupId,
        target: Option<DatabaseId>,
        drop_existing: bool,
    ) -> Result<Admission> {
        let backup = self
            .ctx
            .store
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("backup {}", backup_id)))?;
        let no_target = format!("a database to restore backup {} into", backup_id);
        let database_id = target
            .or(backup.database_id)
            .ok_or(EngineError::NotFound(no_target))?;

        let executor = RestoreExecutor::new(Arc::clone(&self.ctx), backup_id, drop_existing);
        self.runner
            .start_task(database_id, TaskType::Restore, Box::new(executor))
            .await
    }

    /// Copy `source` into `target`. Admission is checked against the target only.
    pub async fn start_import(&self, source: DatabaseId, target: DatabaseId) -> Result<Admission> {
        let source = self
            .ctx
            .store
            .get_database(source)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("source database {}", source)))?;

        let executor = ImportExecutor::new(Arc::clone(&self.ctx), source.access());
        self.runner
            .start_task(target, TaskType::Import, Box::new(executor))
            .await
    }

    pub async fn start_delete(&self, backup_id: BackupId) -> Result<Deletion> {
        let backup = self
            .ctx
            .store
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("backup {}", backup_id)))?;

        match backup.database_id {
            Some(database_id) => {
                let executor = DeleteBackupExecutor::new(Arc::clone(&self.ctx), vec![backup_id]);
                let admission = self
                    .runner
                    .start_task(database_id, TaskType::DeleteBackup, Box::new(executor))
                    .await?;
                Ok(Deletion::Task(admission))
            }
            None => {
                delete_backups(&self.ctx, &[backup_id], None).await?;
                Ok(Deletion::Immediate)
            }
        }
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> Result<CancelRequest> {
        self.runner.request_cancellation(task_id).await
    }

    /// Validate, persist and arm a new backup policy.
    pub async fn create_policy(
        &self,
        database_id: DatabaseId,
        cron_expression: &str,
        retention_days: Option<u32>,
        mode: BackupMode,
    ) -> Result<BackupPolicy> {
        if self.ctx.store.get_database(database_id).await?.is_none() {
            let missing = EngineError::NotFound(format!("database {}", database_id));
            return Err(missing.into());
        }

        let created_at = Utc::now();
        next_occurrence(cron_expression, created_at)?;

        let mut policy = self
            .ctx
            .store
            .insert_policy(&NewBackupPolicy {
                database_id,
                cron_expression: cron_expression.trim().to_string(),
                retention_days,
                mode,
                created_at,
            })
            .await
            .context("Failed to create backup policy")?;

        policy.next_run_at = self.scheduler.schedule_recurring(&policy).await?;
        info!(
            policy_id = policy.id,
            database_id,
            cron = %policy.cron_expression,
            "backup policy created"
        );
        Ok(policy)
    }

    pub async fn delete_policy(&self, policy_id: PolicyId) -> Result<bool> {
        self.scheduler.delete_policy(policy_id).await
    }
}
