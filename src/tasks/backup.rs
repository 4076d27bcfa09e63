// ABOUTME: Dumps a target database into a compressed archive and records the backup
// ABOUTME: Partial archives are removed whenever the run does not succeed

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ExecutionOutcome, TaskCommands, TaskExecutor};
use crate::compression::CompressionFormat;
use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::models::{
    BackupMode, CancellationType, CollectionCount, NewBackup, PolicyId, SourceMetadata,
    TargetDatabaseAccess, TaskProgress, TaskState,
};
use crate::process::{CancellationPoll, ProcessOutcome, ProcessSpec};
use crate::progress::ProgressExtractor;

pub struct BackupExecutor {
    ctx: Arc<EngineContext>,
    mode: BackupMode,
    policy_id: Option<PolicyId>,
}

impl BackupExecutor {
    pub fn manual(ctx: Arc<EngineContext>, mode: BackupMode) -> Self {
        Self {
            ctx,
            mode,
            policy_id: None,
        }
    }

    pub fn scheduled(ctx: Arc<EngineContext>, mode: BackupMode, policy_id: PolicyId) -> Self {
        Self {
            ctx,
            mode,
            policy_id: Some(policy_id),
        }
    }

    fn chain(
        &self,
        target: &TargetDatabaseAccess,
        archive: &Path,
        format: CompressionFormat,
    ) -> Vec<ProcessSpec> {
        let dump_args = [
            format!("--uri={}", target.connection_string),
            format!("--db={}", target.database_name),
        ];
        let dump = ProcessSpec::new(&self.ctx.tools.mongodump).args(dump_args);

        match (format, self.mode.zstd_level()) {
            (CompressionFormat::Zstd, Some(level)) => {
                let level = format!("-{}", level);
                let output = archive.to_string_lossy().into_owned();
                let flags = ["-q", "-f", level.as_str(), "-T0", "-o", output.as_str()];
                let zstd = self.ctx.compression.zstd_program();
                vec![dump.arg("--archive"), ProcessSpec::new(zstd).args(flags)]
            }
            _ => {
                let archive_arg = format!("--archive={}", archive.display());
                vec![dump.arg(archive_arg).arg("--gzip")]
            }
        }
    }

    async fn dump(
        &self,
        commands: &TaskCommands,
        target: &TargetDatabaseAccess,
        archive: &Path,
        format: CompressionFormat,
        collections: Vec<CollectionCount>,
        started: DateTime<Utc>,
    ) -> Result<ExecutionOutcome> {
        commands.check_cancelled().await?;

        let mut extractor = ProgressExtractor::dump(collections);
        let initial = extractor.snapshot();
        let progress = TaskProgress::detailed("Backing up", 0, initial.total, "documents");
        commands.report_progress(progress);

        let chain = self.chain(target, archive, format);
        let outcome = self
            .ctx
            .processes
            .run(
                &chain,
                |chunk| {
                    if chunk.stage != 0 {
                        return;
                    }
                    if let Some(snapshot) = extractor.feed(&chunk.bytes) {
                        commands.report_progress(TaskProgress::detailed(
                            "Backing up",
                            snapshot.current,
                            snapshot.total,
                            "documents",
                        ));
                    }
                },
                Some(commands as &dyn CancellationPoll),
            )
            .await;
        extractor.finish();

        match outcome {
            ProcessOutcome::Cancelled => Err(EngineError::Cancelled.into()),
            ProcessOutcome::Failure(failure) => {
                let message = format!("Backup failed: {}", failure);
                Ok(ExecutionOutcome::error(message))
            }
            ProcessOutcome::Success => {
                commands
                    .set_cancellation_type(CancellationType::NotCancellable)
                    .await?;

                let missing = || format!("Backup archive {} was not written", archive.display());
                let size_bytes = tokio::fs::metadata(archive)
                    .await
                    .with_context(missing)?
                    .len();
                let source = SourceMetadata {
                    database_name: target.database_name.clone(),
                    collections: extractor.collection_counts(),
                };
                let documents: u64 = source.collections.iter().map(|c| c.documents).sum();

                let backup = self
                    .ctx
                    .store
                    .insert_backup(&NewBackup {
                        database_id: Some(target.id),
                        source,
                        archive_path: archive.to_path_buf(),
                        size_bytes,
                        mode: self.mode,
                        policy_id: self.policy_id,
                        created_at: started,
                        finished_at: Utc::now(),
                    })
                    .await?;

                info!(
                    task_id = commands.task_id(),
                    backup_id = backup.id,
                    size_bytes,
                    path = %archive.display(),
                    "backup archive recorded"
                );
                let message = format!("Backed up {} documents ({} bytes)", documents, size_bytes);
                Ok(ExecutionOutcome::successful(message).with_backup(backup.id))
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for BackupExecutor {
    async fn execute(
        &self,
        commands: &TaskCommands,
        target: &TargetDatabaseAccess,
    ) -> Result<ExecutionOutcome> {
        let format = match self.ctx.compression.format_for_mode(self.mode).await {
            Ok(format) => format,
            Err(e) => return Ok(ExecutionOutcome::error(e.to_string())),
        };

        commands.report_progress(TaskProgress::uncertain("Listing collections"));
        let collections = match self.ctx.inspector.list_collections(target).await {
            Ok(collections) => collections,
            Err(e) => {
                warn!(
                    task_id = commands.task_id(),
                    error = %format!("{:#}", e),
                    "could not list collections"
                );
                let message = format!("Could not read the database: {}", e);
                return Ok(ExecutionOutcome::error(message));
            }
        };

        let dir = &self.ctx.backup_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;

        let started = Utc::now();
        let task_id = commands.task_id();
        let file_name = archive_file_name(&target.database_name, started, task_id, format);
        let archive = dir.join(file_name);

        commands
            .set_cancellation_type(CancellationType::SafeToCancel)
            .await?;

        let result = self
            .dump(commands, target, &archive, format, collections, started)
            .await;

        if !matches!(&result, Ok(outcome) if outcome.state == TaskState::Successful) {
            remove_partial_archive(&archive).await;
        }
        result
    }
}

/// `{database}-{timestamp}-{task}.archive.{ext}` with unsafe characters replaced.
fn archive_file_name(
    database_name: &str,
    started: DateTime<Utc>,
    task_id: i64,
    format: CompressionFormat,
) -> PathBuf {
    let database: String = database_name.chars().map(file_name_char).collect();
    PathBuf::from(format!(
        "{}-{}-{}.archive.{}",
        database,
        started.format("%Y%m%dT%H%M%SZ"),
        task_id,
        format.extension()
    ))
}

fn file_name_char(c: char) -> char {
    if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
        c
    } else {
        '_'
    }
}

async fn remove_partial_archive(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial backup archive"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove partial backup archive")
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::TaskType;
    use crate::tasks::test_support::{
        add_database, fake_tools, test_context, wait_for_cancellation_type, write_script,
    };
    use crate::tasks::{Admission, TaskRunner};
    use tempfile::TempDir;

    const DUMP_OK: &str = r#"
for arg in "$@"; do
  case "$arg" in --archive=*) out="${arg#--archive=}";; esac
done
echo "2024-05-01T10:00:00.000+0000	[##########..............]  app.users  5/10  (50.0%)" 1>&2
printf 'archive-bytes' > "$out"
echo "2024-05-01T10:00:01.000+0000	done dumping app.users (10 documents)" 1>&2
"#;

    fn backup_files(dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_successful_backup_records_archive() {
        let dir = TempDir::new().unwrap();
        let mut tools = fake_tools(dir.path());
        tools.mongodump = write_script(dir.path(), "mongodump", DUMP_OK);
        let ctx = test_context(dir.path(), tools);
        let db = add_database(&ctx).await;
        let runner = TaskRunner::new(ctx.store.clone());

        let Admission::Accepted { handle, .. } = runner
            .start_task(
                db.id,
                TaskType::ManualBackup,
                Box::new(BackupExecutor::manual(ctx.clone(), BackupMode::Compatible)),
            )
            .await
            .unwrap()
        else {
            panic!("backup should be accepted");
        };
        let completion = handle.wait().await.unwrap();
        let message = &completion.message;
        assert_eq!(completion.state, TaskState::Successful, "{}", message);

        let backup = ctx
            .store
            .get_backup(completion.backup_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backup.database_id, Some(db.id));
        assert_eq!(backup.size_bytes, "archive-bytes".len() as u64);
        assert_eq!(backup.mode, BackupMode::Compatible);
        assert_eq!(backup.policy_id, None);
        assert_eq!(backup.source.collections[0].documents, 10);
        let path = backup.archive_path.to_string_lossy();
        assert!(path.ends_with(".archive.gz"));
        assert!(backup.archive_path.exists());
    }

    #[tokio::test]
    async fn test_failed_dump_leaves_no_archive() {
        let dir = TempDir::new().unwrap();
        let mut tools = fake_tools(dir.path());
        tools.mongodump = write_script(
            dir.path(),
            "mongodump",
            r#"
for arg in "$@"; do
  case "$arg" in --archive=*) out="${arg#--archive=}";; esac
done
printf 'half' > "$out"
exit 3
"#,
        );
        let ctx = test_context(dir.path(), tools);
        let db = add_database(&ctx).await;
        let runner = TaskRunner::new(ctx.store.clone());

        let Admission::Accepted { handle, .. } = runner
            .start_task(
                db.id,
                TaskType::ManualBackup,
                Box::new(BackupExecutor::manual(ctx.clone(), BackupMode::Compatible)),
            )
            .await
            .unwrap()
        else {
            panic!("backup should be accepted");
        };
        let completion = handle.wait().await.unwrap();

        assert_eq!(completion.state, TaskState::Error);
        assert!(completion.message.starts_with("Backup failed:"));
        assert!(completion.message.ends_with("exited with code 3"));
        assert!(backup_files(&ctx.backup_dir).is_empty());
        assert!(ctx.store.list_backups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_compressor_rejected_before_spawn() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("dump-ran");
        let mut tools = fake_tools(dir.path());
        let touch = format!("touch {}", marker.display());
        tools.mongodump = write_script(dir.path(), "mongodump", &touch);
        let ctx = test_context(dir.path(), tools);
        let db = add_database(&ctx).await;
        let runner = TaskRunner::new(ctx.store.clone());

        let Admission::Accepted { handle, .. } = runner
            .start_task(
                db.id,
                TaskType::ManualBackup,
                Box::new(BackupExecutor::manual(ctx.clone(), BackupMode::Compact)),
            )
            .await
            .unwrap()
        else {
            panic!("backup should be accepted");
        };
        let completion = handle.wait().await.unwrap();

        assert_eq!(completion.state, TaskState::Error);
        assert!(completion.message.contains("not installed"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_cancelled_backup_removes_partial_archive() {
        let dir = TempDir::new().unwrap();
        let mut tools = fake_tools(dir.path());
        tools.mongodump = write_script(
            dir.path(),
            "mongodump",
            r#"
for arg in "$@"; do
  case "$arg" in --archive=*) out="${arg#--archive=}";; esac
done
printf 'partial' > "$out"
exec sleep 5
"#,
        );
        let ctx = test_context(dir.path(), tools);
        let db = add_database(&ctx).await;
        let runner = TaskRunner::new(ctx.store.clone());

        let Admission::Accepted { task_id, handle } = runner
            .start_task(
                db.id,
                TaskType::ManualBackup,
                Box::new(BackupExecutor::manual(ctx.clone(), BackupMode::Compatible)),
            )
            .await
            .unwrap()
        else {
            panic!("backup should be accepted");
        };

        wait_for_cancellation_type(&ctx, task_id, CancellationType::SafeToCancel).await;
        runner.request_cancellation(task_id).await.unwrap();

        let started = std::time::Instant::now();
        let completion = handle.wait().await.unwrap();
        assert_eq!(completion.state, TaskState::Cancelled);
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
        assert!(backup_files(&ctx.backup_dir).is_empty());
        assert!(ctx.store.list_backups().await.unwrap().is_empty());
    }

    #[test]
    fn test_archive_file_name_is_sanitized() {
        let started = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let name = archive_file_name("my db/prod", started, 7, CompressionFormat::Zstd);
        let expected = "my_db_prod-20240501T100000Z-7.archive.zst";
        assert_eq!(name, PathBuf::from(expected));
    }

    #[test]
    fn test_zstd_chain_pipes_dump_into_compressor() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(dir.path(), fake_tools(dir.path()));
        let executor = BackupExecutor::manual(ctx, BackupMode::Balanced);
        let target = TargetDatabaseAccess {
            id: 1,
            connection_string: "mongodb://localhost".into(),
            database_name: "app".into(),
        };

        let archive = Path::new("/b/app.archive.zst");
        let chain = executor.chain(&target, archive, CompressionFormat::Zstd);
        assert_eq!(chain.len(), 2);
        assert!(chain[0].args.contains(&"--archive".to_string()));
        assert!(chain[1].args.contains(&"-10".to_string()));
        assert_eq!(chain[1].args.last().unwrap(), "/b/app.archive.zst");
    }
}
