// ABOUTME: Copies one database into another by piping a dump straight into a restore
// ABOUTME: No intermediate file is written and the job cannot be cancelled

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ExecutionOutcome, TaskCommands, TaskExecutor};
use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::models::{CancellationType, TargetDatabaseAccess, TaskProgress};
use crate::process::{ProcessOutcome, ProcessSpec};
use crate::progress::ProgressExtractor;

pub struct ImportExecutor {
    ctx: Arc<EngineContext>,
    source: TargetDatabaseAccess,
}

impl ImportExecutor {
    pub fn new(ctx: Arc<EngineContext>, source: TargetDatabaseAccess) -> Self {
        Self { ctx, source }
    }

    fn chain(&self, target: &TargetDatabaseAccess) -> Vec<ProcessSpec> {
        let source = &self.source;
        let dump_args = [
            format!("--uri={}", source.connection_string),
            format!("--db={}", source.database_name),
            "--archive".to_string(),
        ];
        let restore_args = [
            format!("--uri={}", target.connection_string),
            "--archive".to_string(),
            format!("--nsFrom={}.*", source.database_name),
            format!("--nsTo={}.*", target.database_name),
        ];

        let tools = &self.ctx.tools;
        let dump = ProcessSpec::new(&tools.mongodump).args(dump_args);
        let restore = ProcessSpec::new(&tools.mongorestore).args(restore_args);
        vec![dump, restore]
    }
}

#[async_trait]
impl TaskExecutor for ImportExecutor {
    async fn execute(
        &self,
        commands: &TaskCommands,
        target: &TargetDatabaseAccess,
    ) -> Result<ExecutionOutcome> {
        commands
            .set_cancellation_type(CancellationType::NotCancellable)
            .await?;

        commands.report_progress(TaskProgress::uncertain("Listing source collections"));
        let collections = match self.ctx.inspector.list_collections(&self.source).await {
            Ok(collections) => collections,
            Err(e) => {
                warn!(
                    task_id = commands.task_id(),
                    error = %format!("{:#}", e),
                    "could not list source collections"
                );
                let message = format!("Could not read the source database: {}", e);
                return Ok(ExecutionOutcome::error(message));
            }
        };

        let mut extractor = ProgressExtractor::dump(collections);
        let total = extractor.snapshot().total;
        commands.report_progress(TaskProgress::detailed("Importing", 0, total, "documents"));

        let outcome = self
            .ctx
            .processes
            .run(
                &self.chain(target),
                |chunk| {
                    if chunk.stage != 0 {
                        return;
                    }
                    if let Some(snapshot) = extractor.feed(&chunk.bytes) {
                        commands.report_progress(TaskProgress::detailed(
                            "Importing",
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
                    source = %self.source.database_name,
                    target = %target.database_name,
                    "import finished"
                );
                let source = &self.source.database_name;
                let message = format!("Imported {} into {}", source, target.database_name);
                Ok(ExecutionOutcome::successful(message))
            }
            ProcessOutcome::Failure(failure) => {
                let message = format!("Import failed: {}", failure);
                Ok(ExecutionOutcome::error(message))
            }
            ProcessOutcome::Cancelled => Err(EngineError::Cancelled.into()),
        }
    }
}
