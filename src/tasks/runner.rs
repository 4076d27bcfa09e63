// ABOUTME: Owns the lifecycle of task records: admission, execution and completion
// ABOUTME: At most one incomplete task may exist per target database

use anyhow::{Context, Result};
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{ExecutionOutcome, TaskCommands, TaskExecutor};
use crate::error::EngineError;
use crate::models::{
    BackupId, CancellationType, DatabaseId, TargetDatabaseAccess, TaskId, TaskProgress, TaskState,
    TaskType,
};
use crate::store::Store;

const UNEXPECTED_FAILURE_MESSAGE: &str =
    "The task failed unexpectedly. Check the server logs for details.";
const CANCELLED_MESSAGE: &str = "The task was cancelled.";
const INTERRUPTED_MESSAGE: &str = "The task was interrupted by a restart.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The database already has an incomplete task.
    Busy,
    DatabaseNotFound,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RejectReason::Busy => write!(f, "Another task is already running on this database"),
            RejectReason::DatabaseNotFound => write!(f, "The database does not exist"),
        }
    }
}

pub enum Admission {
    Accepted { task_id: TaskId, handle: TaskHandle },
    Rejected(RejectReason),
}

impl Admission {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Admission::Accepted { task_id, .. } => Some(*task_id),
            Admission::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: String,
    pub backup_id: Option<BackupId>,
}

/// Await a started task. Dropping the handle leaves the task running.
pub struct TaskHandle {
    task_id: TaskId,
    join: JoinHandle<TaskCompletion>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn wait(self) -> Result<TaskCompletion> {
        let task_id = self.task_id;
        let context = || format!("Task {} supervisor did not finish", task_id);
        self.join.await.with_context(context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    Requested,
    NotCancellable,
    AlreadyComplete,
    NotFound,
}

pub struct TaskRunner {
    store: Arc<dyn Store>,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Admit and start a task against `database_id`.
    ///
    /// Returns immediately once the task record exists; the executor runs in
    /// the background. A database with an incomplete task is refused with
    /// [`RejectReason::Busy`] rather than queued.
    pub async fn start_task(
        &self,
        database_id: DatabaseId,
        task_type: TaskType,
        executor: Box<dyn TaskExecutor>,
    ) -> Result<Admission> {
        let Some(database) = self.store.get_database(database_id).await? else {
            return Ok(Admission::Rejected(RejectReason::DatabaseNotFound));
        };

        let initial = TaskProgress::uncertain(format!("Starting {}", task_type.describe()));
        let Some(task) = self
            .store
            .insert_task_if_idle(database_id, task_type, &initial)
            .await?
        else {
            info!(
                database_id,
                task_type = task_type.as_str(),
                "database busy, task refused"
            );
            return Ok(Admission::Rejected(RejectReason::Busy));
        };

        info!(
            task_id = task.id,
            database_id,
            task_type = task_type.as_str(),
            "task started"
        );

        let join = tokio::spawn(run_task(
            Arc::clone(&self.store),
            task.id,
            database.access(),
            initial,
            executor,
        ));

        Ok(Admission::Accepted {
            task_id: task.id,
            handle: TaskHandle {
                task_id: task.id,
                join,
            },
        })
    }

    /// Flag a task for cancellation on behalf of a user.
    ///
    /// Dangerous tasks accept the flag, but their executors ignore it until
    /// they reach a cancellable phase.
    pub async fn request_cancellation(&self, task_id: TaskId) -> Result<CancelRequest> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(CancelRequest::NotFound);
        };
        if task.is_complete {
            return Ok(CancelRequest::AlreadyComplete);
        }
        if task.cancellation_type == CancellationType::NotCancellable {
            return Ok(CancelRequest::NotCancellable);
        }

        self.store.request_cancel(task_id).await?;
        info!(
            task_id,
            cancellation_type = task.cancellation_type.as_str(),
            "cancellation requested"
        );
        Ok(CancelRequest::Requested)
    }

    /// Fail tasks a previous process left running so their databases are usable again.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let count = self
            .store
            .fail_interrupted_tasks(&TaskProgress::uncertain(INTERRUPTED_MESSAGE))
            .await?;
        if count > 0 {
            warn!(count, "marked tasks interrupted by a restart as failed");
        }
        Ok(count)
    }
}

async fn run_task(
    store: Arc<dyn Store>,
    task_id: TaskId,
    target: TargetDatabaseAccess,
    initial: TaskProgress,
    executor: Box<dyn TaskExecutor>,
) -> TaskCompletion {
    let commands = TaskCommands::new(task_id, Arc::clone(&store), initial);

    let result = AssertUnwindSafe(executor.execute(&commands, &target))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(outcome)) if outcome.state == TaskState::Running => {
            error!(
                task_id,
                "executor returned without reaching a terminal state"
            );
            ExecutionOutcome::error(UNEXPECTED_FAILURE_MESSAGE)
        }
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) if EngineError::is_cancellation(&e) => {
            ExecutionOutcome::cancelled(CANCELLED_MESSAGE)
        }
        Ok(Err(e)) => {
            error!(task_id, error = %format!("{:#}", e), "task failed");
            ExecutionOutcome::error(UNEXPECTED_FAILURE_MESSAGE)
        }
        Err(_) => {
            error!(task_id, "task executor panicked");
            ExecutionOutcome::error(UNEXPECTED_FAILURE_MESSAGE)
        }
    };

    commands.finish().await;

    let terminal = TaskProgress::uncertain(outcome.message.clone());
    if let Err(e) = store.complete_task(task_id, outcome.state, &terminal).await {
        error!(task_id, error = %format!("{:#}", e), "failed to record task completion");
    }

    info!(task_id, state = outcome.state.as_str(), message = %outcome.message, "task finished");

    TaskCompletion {
        task_id,
        state: outcome.state,
        message: outcome.message,
        backup_id: outcome.backup_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Task;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Scripted(fn() -> Result<ExecutionOutcome>);

    #[async_trait]
    impl TaskExecutor for Scripted {
        async fn execute(
            &self,
            commands: &TaskCommands,
            _target: &TargetDatabaseAccess,
        ) -> Result<ExecutionOutcome> {
            commands.report_progress(TaskProgress::detailed("Working", 1, 2, "steps"));
            (self.0)()
        }
    }

    struct WaitForRelease(Arc<Notify>);

    #[async_trait]
    impl TaskExecutor for WaitForRelease {
        async fn execute(
            &self,
            _commands: &TaskCommands,
            _target: &TargetDatabaseAccess,
        ) -> Result<ExecutionOutcome> {
            self.0.notified().await;
            Ok(ExecutionOutcome::successful("released"))
        }
    }

    struct CancellableLoop;

    #[async_trait]
    impl TaskExecutor for CancellableLoop {
        async fn execute(
            &self,
            commands: &TaskCommands,
            _target: &TargetDatabaseAccess,
        ) -> Result<ExecutionOutcome> {
            commands
                .set_cancellation_type(CancellationType::SafeToCancel)
                .await?;
            loop {
                commands.check_cancelled().await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskExecutor for Panics {
        async fn execute(
            &self,
            _commands: &TaskCommands,
            _target: &TargetDatabaseAccess,
        ) -> Result<ExecutionOutcome> {
            panic!("executor bug");
        }
    }

    async fn setup() -> (Arc<dyn Store>, TaskRunner, DatabaseId) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let db = store
            .insert_database("db", "mongodb://localhost", "app")
            .await
            .unwrap();
        (store.clone(), TaskRunner::new(store), db.id)
    }

    async fn run_to_completion(
        runner: &TaskRunner,
        database_id: DatabaseId,
        executor: Box<dyn TaskExecutor>,
    ) -> TaskCompletion {
        match runner
            .start_task(database_id, TaskType::ManualBackup, executor)
            .await
            .unwrap()
        {
            Admission::Accepted { handle, .. } => handle.wait().await.unwrap(),
            Admission::Rejected(reason) => panic!("task rejected: {}", reason),
        }
    }

    fn succeeds() -> Box<dyn TaskExecutor> {
        Box::new(Scripted(|| Ok(ExecutionOutcome::successful("x"))))
    }

    fn assert_complete_and_terminal(task: &Task) {
        assert!(task.is_complete);
        assert!(task.state.is_terminal());
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_successful_task_is_completed() {
        let (store, runner, db) = setup().await;

        let completion = run_to_completion(
            &runner,
            db,
            Box::new(Scripted(|| Ok(ExecutionOutcome::successful("all good")))),
        )
        .await;
        assert_eq!(completion.state, TaskState::Successful);

        let task = store.get_task(completion.task_id).await.unwrap().unwrap();
        assert_complete_and_terminal(&task);
        assert_eq!(task.state, TaskState::Successful);
        assert_eq!(task.progress, TaskProgress::uncertain("all good"));
    }

    #[tokio::test]
    async fn test_unexpected_error_gets_generic_message() {
        let (store, runner, db) = setup().await;

        let completion = run_to_completion(
            &runner,
            db,
            Box::new(Scripted(|| Err(anyhow::anyhow!("connection reset")))),
        )
        .await;

        let task = store.get_task(completion.task_id).await.unwrap().unwrap();
        assert_complete_and_terminal(&task);
        assert_eq!(task.state, TaskState::Error);
        assert_eq!(task.progress.message(), UNEXPECTED_FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn test_cancellation_error_maps_to_cancelled() {
        let (store, runner, db) = setup().await;

        let completion = run_to_completion(
            &runner,
            db,
            Box::new(Scripted(|| Err(EngineError::Cancelled.into()))),
        )
        .await;

        let task = store.get_task(completion.task_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert_complete_and_terminal(&task);
    }

    #[tokio::test]
    async fn test_running_outcome_is_not_accepted_as_terminal() {
        let (store, runner, db) = setup().await;

        let completion = run_to_completion(
            &runner,
            db,
            Box::new(Scripted(|| {
                Ok(ExecutionOutcome {
                    state: TaskState::Running,
                    message: "still going".into(),
                    backup_id: None,
                })
            })),
        )
        .await;

        assert_eq!(completion.state, TaskState::Error);
        let task = store.get_task(completion.task_id).await.unwrap().unwrap();
        assert_complete_and_terminal(&task);
    }

    #[tokio::test]
    async fn test_panicking_executor_still_completes_task() {
        let (store, runner, db) = setup().await;

        let completion = run_to_completion(&runner, db, Box::new(Panics)).await;
        assert_eq!(completion.state, TaskState::Error);
        let task = store.get_task(completion.task_id).await.unwrap().unwrap();
        assert!(task.is_complete);
    }

    #[tokio::test]
    async fn test_second_task_on_same_database_is_rejected() {
        let (_store, runner, db) = setup().await;
        let release = Arc::new(Notify::new());

        let blocker = Box::new(WaitForRelease(release.clone()));
        let first = runner
            .start_task(db, TaskType::Restore, blocker)
            .await
            .unwrap();
        let Admission::Accepted { handle, .. } = first else {
            panic!("first task should be accepted");
        };

        let others = [
            TaskType::ManualBackup,
            TaskType::Import,
            TaskType::DeleteBackup,
        ];
        for task_type in others {
            let second = runner.start_task(db, task_type, succeeds()).await.unwrap();
            assert!(matches!(second, Admission::Rejected(RejectReason::Busy)));
        }

        release.notify_one();
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Successful);

        let third = runner
            .start_task(db, TaskType::ManualBackup, succeeds())
            .await
            .unwrap();
        assert!(third.task_id().is_some());
    }

    #[tokio::test]
    async fn test_unknown_database_is_rejected() {
        let (_store, runner, _db) = setup().await;
        let admission = runner
            .start_task(999, TaskType::ManualBackup, succeeds())
            .await
            .unwrap();
        assert!(matches!(
            admission,
            Admission::Rejected(RejectReason::DatabaseNotFound)
        ));
    }

    #[tokio::test]
    async fn test_request_cancellation_stops_safe_task() {
        let (store, runner, db) = setup().await;

        let Admission::Accepted { task_id, handle } = runner
            .start_task(db, TaskType::ManualBackup, Box::new(CancellableLoop))
            .await
            .unwrap()
        else {
            panic!("task should be accepted");
        };

        // Wait for the executor to declare itself cancellable.
        for _ in 0..100 {
            let task = store.get_task(task_id).await.unwrap().unwrap();
            if task.cancellation_type == CancellationType::SafeToCancel {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(
            runner.request_cancellation(task_id).await.unwrap(),
            CancelRequest::Requested
        );
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Cancelled);
        assert_eq!(
            runner.request_cancellation(task_id).await.unwrap(),
            CancelRequest::AlreadyComplete
        );
    }

    #[tokio::test]
    async fn test_request_cancellation_refused_when_not_cancellable() {
        let (store, runner, db) = setup().await;
        let release = Arc::new(Notify::new());

        let blocker = Box::new(WaitForRelease(release.clone()));
        let Admission::Accepted { task_id, handle } = runner
            .start_task(db, TaskType::Import, blocker)
            .await
            .unwrap()
        else {
            panic!("task should be accepted");
        };

        assert_eq!(
            runner.request_cancellation(task_id).await.unwrap(),
            CancelRequest::NotCancellable
        );
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert!(!task.cancel_requested);
        assert_eq!(
            runner.request_cancellation(4242).await.unwrap(),
            CancelRequest::NotFound
        );

        release.notify_one();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_interrupted_frees_database() {
        let (store, runner, db) = setup().await;
        store
            .insert_task_if_idle(db, TaskType::Restore, &TaskProgress::uncertain("Starting"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(runner.recover_interrupted().await.unwrap(), 1);
        assert!(store.find_incomplete_tasks(db).await.unwrap().is_empty());
    }
}
