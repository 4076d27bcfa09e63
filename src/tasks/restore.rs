// ABOUTME: Restores a recorded backup archive into a target database
// ABOUTME: Runs dangerous-to-cancel; cancellation requests are ignored until it finishes

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{ExecutionOutcome, TaskCommands, TaskExecutor};
use crate::compression::CompressionFormat;
use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::models::{BackupId, CancellationType, TargetDatabaseAccess, TaskProgress};
use crate::process::{ProcessOutcome, ProcessSpec};
use crate::progress::ProgressExtractor;

pub struct RestoreExecutor {
    ctx: Arc<EngineContext>,
    backup_id: BackupId,
    /// Drop each collection before restoring it.
    drop_existing: bool,
}

impl RestoreExecutor {
    pub fn new(ctx: Arc<EngineContext>, backup_id: BackupId, drop_existing: bool) -> Self {
        Self {
            ctx,
            backup_id,
            drop_existing,
        }
    }

    fn chain(
        &self,
        target: &TargetDatabaseAccess,
        archive: &Path,
        source_database: &str,
        format: CompressionFormat,
    ) -> Vec<ProcessSpec> {
        let uri = format!("--uri={}", target.connection_string);
        let mut restore = ProcessSpec::new(&self.ctx.tools.mongorestore).arg(uri);
        restore = if format.is_native() {
            let archive_arg = format!("--archive={}", archive.display());
            restore.arg(archive_arg).arg("--gzip")
        } else {
            restore.arg("--archive")
        };
        if self.drop_existing {
            restore = restore.arg("--drop");
        }
        let namespaces = [
            format!("--nsFrom={}.*", source_database),
            format!("--nsTo={}.*", target.database_name),
        ];
        restore = restore.args(namespaces);

        if format.is_native() {
            vec![restore]
        } else {
            let zstd = self.ctx.compression.zstd_program();
            let decompress = ProcessSpec::new(zstd)
                .args(["-d", "-c", "-q"])
                .arg(archive.to_string_lossy());
            vec![decompress, restore]
        }
    }
}

#[async_trait]
impl TaskExecutor for RestoreExecutor {
    async fn execute(
        &self,
        commands: &TaskCommands,
        target: &TargetDatabaseAccess,
    ) -> Result<ExecutionOutcome> {
        commands
            .set_cancellation_type(CancellationType::DangerousToCancel)
            .await?;

        let Some(backup) = self.ctx.store.get_backup(self.backup_id).await? else {
            let message = format!("Backup {} no longer exists", self.backup_id);
            return Ok(ExecutionOutcome::error(message));
        };

        let format = match CompressionFormat::from_path(&backup.archive_path) {
            Ok(format) => format,
            Err(e) => return Ok(ExecutionOutcome::error(e.to_string())),
        };
        if let Err(e) = self.ctx.compression.ensure_supported(format).await {
            return Ok(ExecutionOutcome::error(e.to_string()));
        }
        let archive = &backup.archive_path;
        if !tokio::fs::try_exists(archive).await.unwrap_or(false) {
            let message = format!("Backup archive {} is missing", archive.display());
            return Ok(ExecutionOutcome::error(message));
        }

        let mut extractor = ProgressExtractor::restore(backup.source.collections.clone());
        let total = extractor.snapshot().total;
        commands.report_progress(TaskProgress::detailed("Restoring", 0, total, "documents"));

        let source_database = &backup.source.database_name;
        let chain = self.chain(target, archive, source_database, format);
        let restore_stage = chain.len() - 1;
        let outcome = self
            .ctx
            .processes
            .run(
                &chain,
                |chunk| {
                    if chunk.stage != restore_stage {
                        return;
                    }
                    if let Some(snapshot) = extractor.feed(&chunk.bytes) {
                        commands.report_progress(TaskProgress::detailed(
                            "Restoring",
                            snapshot.current,
                            snapshot.total,
                            "documents",
                        ));
                    }
                },
                None,
            )
            .await;
        extractor.finish();

        match outcome {
            ProcessOutcome::Success => {
                info!(
                    task_id = commands.task_id(),
                    backup_id = backup.id,
                    "restore finished"
                );
                let database = &target.database_name;
                let message = format!("Restored backup {} into {}", backup.id, database);
                Ok(ExecutionOutcome::successful(message))
            }
            ProcessOutcome::Failure(failure) => {
                let message = format!("Restore failed: {}", failure);
                Ok(ExecutionOutcome::error(message))
            }
            ProcessOutcome::Cancelled => Err(EngineError::Cancelled.into()),
        }
    }
}
