// ABOUTME: Command surface a running executor uses to talk to its task record
// ABOUTME: Coalesces progress reports so at most one write is in flight per task

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::EngineError;
use crate::models::{CancellationType, TaskId, TaskProgress};
use crate::process::CancellationPoll;
use crate::store::Store;

/// Destination for coalesced progress writes.
#[async_trait]
pub trait ProgressWriter: Send + Sync {
    async fn write_progress(&self, task_id: TaskId, progress: &TaskProgress) -> Result<()>;
}

#[async_trait]
impl ProgressWriter for Arc<dyn Store> {
    async fn write_progress(&self, task_id: TaskId, progress: &TaskProgress) -> Result<()> {
        self.update_task_progress(task_id, progress).await
    }
}

/// Single-slot progress buffer drained by one writer task.
///
/// The writer is Idle while waiting for a new value and Draining while it
/// persists the newest one. Values reported during a write replace each
/// other in the slot, so a burst collapses into one write of the latest
/// value and writes for a task never overlap.
pub(crate) struct ProgressDispatcher {
    latest: watch::Sender<TaskProgress>,
    writer: JoinHandle<()>,
}

impl ProgressDispatcher {
    pub(crate) fn spawn(
        task_id: TaskId,
        writer: Arc<dyn ProgressWriter>,
        initial: TaskProgress,
    ) -> Self {
        let (latest, mut rx) = watch::channel(initial);

        let writer = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let progress = rx.borrow_and_update().clone();
                if let Err(e) = writer.write_progress(task_id, &progress).await {
                    warn!(task_id, error = %e, "failed to persist task progress");
                }
            }
        });

        Self { latest, writer }
    }

    pub(crate) fn report(&self, progress: TaskProgress) {
        self.latest.send_replace(progress);
    }

    /// Stop accepting reports and wait until the newest value has been written.
    pub(crate) async fn finish(self) {
        let Self { latest, writer } = self;
        drop(latest);
        if let Err(e) = writer.await {
            warn!(error = %e, "progress writer ended abnormally");
        }
    }
}

pub struct TaskCommands {
    task_id: TaskId,
    store: Arc<dyn Store>,
    progress: ProgressDispatcher,
}

impl TaskCommands {
    pub(crate) fn new(task_id: TaskId, store: Arc<dyn Store>, initial: TaskProgress) -> Self {
        let writer: Arc<dyn ProgressWriter> = Arc::new(Arc::clone(&store));
        Self {
            task_id,
            progress: ProgressDispatcher::spawn(task_id, writer, initial),
            store,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Record the latest progress. Never waits on storage.
    pub fn report_progress(&self, progress: TaskProgress) {
        self.progress.report(progress);
    }

    pub async fn set_cancellation_type(&self, cancellation_type: CancellationType) -> Result<()> {
        self.store
            .set_cancellation_type(self.task_id, cancellation_type)
            .await
    }

    /// Fails with [`EngineError::Cancelled`] if a cancellation was requested
    /// while the task is safe to cancel. Requests are ignored in any other
    /// cancellation stance.
    pub async fn check_cancelled(&self) -> Result<()> {
        let task = self
            .store
            .get_task(self.task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task {}", self.task_id)))?;

        if task.cancel_requested && task.cancellation_type == CancellationType::SafeToCancel {
            return Err(EngineError::Cancelled.into());
        }
        Ok(())
    }

    pub(crate) async fn finish(self) {
        self.progress.finish().await;
    }
}

#[async_trait]
impl CancellationPoll for TaskCommands {
    async fn cancel_requested(&self) -> bool {
        match self.check_cancelled().await {
            Ok(()) => false,
            Err(e) if EngineError::is_cancellation(&e) => true,
            Err(e) => {
                warn!(task_id = self.task_id, error = %e, "could not check for cancellation");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;
    use crate::store::SqliteStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct SlowWriter {
        writes: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl ProgressWriter for SlowWriter {
        async fn write_progress(&self, _task_id: TaskId, progress: &TaskProgress) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            let message = progress.message().to_string();
            self.writes.lock().unwrap().push(message);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dispatcher_for(writer: &Arc<SlowWriter>) -> ProgressDispatcher {
        ProgressDispatcher::spawn(1, writer.clone(), TaskProgress::uncertain("Starting"))
    }

    #[tokio::test]
    async fn test_burst_of_reports_collapses_to_one_write() {
        let writer = Arc::new(SlowWriter::default());
        let dispatcher = dispatcher_for(&writer);

        for i in 1..=50 {
            dispatcher.report(TaskProgress::uncertain(format!("step {}", i)));
        }
        dispatcher.finish().await;

        assert_eq!(*writer.writes.lock().unwrap(), vec!["step 50".to_string()]);
    }

    #[tokio::test]
    async fn test_reports_during_write_keep_only_latest() {
        let writer = Arc::new(SlowWriter::default());
        let dispatcher = dispatcher_for(&writer);

        dispatcher.report(TaskProgress::uncertain("a"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatcher.report(TaskProgress::uncertain("b"));
        dispatcher.report(TaskProgress::uncertain("c"));
        dispatcher.report(TaskProgress::uncertain("d"));
        dispatcher.finish().await;

        let writes = writer.writes.lock().unwrap().clone();
        assert_eq!(writes, vec!["a", "d"]);
        assert_eq!(writer.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_reports_means_no_writes() {
        let writer = Arc::new(SlowWriter::default());
        let dispatcher = dispatcher_for(&writer);
        dispatcher.finish().await;
        assert!(writer.writes.lock().unwrap().is_empty());
    }

    async fn running_task(store: &Arc<dyn Store>) -> TaskId {
        let db = store
            .insert_database("db", "mongodb://localhost", "app")
            .await
            .unwrap();
        let progress = TaskProgress::uncertain("Starting");
        store
            .insert_task_if_idle(db.id, TaskType::ManualBackup, &progress)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_cancellation_honoured_only_when_safe() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let task_id = running_task(&store).await;
        let starting = TaskProgress::uncertain("Starting");
        let commands = TaskCommands::new(task_id, store.clone(), starting);

        assert!(commands.check_cancelled().await.is_ok());

        store.request_cancel(task_id).await.unwrap();
        assert!(commands.check_cancelled().await.is_ok());
        assert!(!commands.cancel_requested().await);

        commands
            .set_cancellation_type(CancellationType::DangerousToCancel)
            .await
            .unwrap();
        assert!(commands.check_cancelled().await.is_ok());

        commands
            .set_cancellation_type(CancellationType::SafeToCancel)
            .await
            .unwrap();
        let err = commands.check_cancelled().await.unwrap_err();
        assert!(EngineError::is_cancellation(&err));
        assert!(commands.cancel_requested().await);

        commands.finish().await;
    }

    #[tokio::test]
    async fn test_reported_progress_reaches_store() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let task_id = running_task(&store).await;
        let starting = TaskProgress::uncertain("Starting");
        let commands = TaskCommands::new(task_id, store.clone(), starting);
        let reported = TaskProgress::detailed("Backing up", 5, 10, "documents");

        commands.report_progress(reported.clone());
        commands.finish().await;

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.progress, reported);
    }
}
