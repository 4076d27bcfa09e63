// ABOUTME: Arms in-process timers for recurring policy backups and retention deletions
// ABOUTME: Timers are rebuilt from stored policies and backups when the engine starts

use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::models::{
    Backup, BackupId, BackupPolicy, DatabaseId, PolicyId, TaskId, TaskState, TaskType,
};
use crate::tasks::{
    delete_backups, Admission, BackupExecutor, DeleteBackupExecutor, RejectReason, TaskCompletion,
    TaskHandle, TaskRunner,
};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Accept standard 5-field expressions as well as the 6/7-field form with seconds.
///
/// Five fields get a leading `0` seconds field, and numeric days of the
/// week are rewritten as names because 5-field cron counts Sunday as 0.
pub fn normalize_cron(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        day_of_week_names(fields[4])
    )
}

fn day_of_week_names(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = range
                .split('-')
                .map(|value| match value.parse::<usize>() {
                    Ok(day) if day <= 7 => DAY_NAMES[day % 7].to_string(),
                    _ => value.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Next occurrence strictly after `after`, evaluated in UTC.
pub fn next_occurrence(expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = Schedule::from_str(&normalize_cron(expression))
        .map_err(|e| EngineError::InvalidSchedule(format!("'{}': {}", expression, e)))?;
    Ok(schedule.after(&after).next())
}

fn delay_until(due: DateTime<Utc>) -> Duration {
    (due - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Slots<K> {
    next_generation: u64,
    armed: HashMap<K, Armed>,
}

/// One pending timer per key; arming a key replaces its previous timer.
struct TimerMap<K> {
    slots: Arc<Mutex<Slots<K>>>,
}

impl<K> Default for TimerMap<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_generation: 0,
                armed: HashMap::new(),
            })),
        }
    }
}

impl<K> TimerMap<K>
where
    K: Copy + Eq + Hash + Send + 'static,
{
    fn arm<F>(&self, key: K, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slots = lock(&self.slots);
        slots.next_generation += 1;
        let generation = slots.next_generation;

        let shared = Arc::clone(&self.slots);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Leave the map before firing so the fire may re-arm this key.
            let current = {
                let mut slots = lock(&shared);
                match slots.armed.get(&key) {
                    Some(armed) if armed.generation == generation => {
                        slots.armed.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                fire.await;
            }
        });

        if let Some(previous) = slots.armed.insert(key, Armed { generation, handle }) {
            previous.handle.abort();
        }
    }

    fn clear(&self, key: K) -> bool {
        match lock(&self.slots).armed.remove(&key) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    fn is_armed(&self, key: K) -> bool {
        lock(&self.slots).armed.contains_key(&key)
    }
}

/// Pending recurring runs by policy and retention deletions by backup.
#[derive(Default)]
pub struct ScheduleTimers {
    runs: TimerMap<PolicyId>,
    deletions: TimerMap<BackupId>,
}

impl ScheduleTimers {
    pub(crate) fn arm_run<F>(&self, policy_id: PolicyId, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runs.arm(policy_id, delay, fire);
    }

    pub(crate) fn arm_deletion<F>(&self, backup_id: BackupId, delay: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.deletions.arm(backup_id, delay, fire);
    }

    pub fn clear_run(&self, policy_id: PolicyId) -> bool {
        self.runs.clear(policy_id)
    }

    pub fn clear_deletion(&self, backup_id: BackupId) -> bool {
        self.deletions.clear(backup_id)
    }

    pub fn run_armed(&self, policy_id: PolicyId) -> bool {
        self.runs.is_armed(policy_id)
    }

    pub fn deletion_armed(&self, backup_id: BackupId) -> bool {
        self.deletions.is_armed(backup_id)
    }
}

pub struct TaskScheduler {
    ctx: Arc<EngineContext>,
    runner: Arc<TaskRunner>,
    backoff: Duration,
}

impl TaskScheduler {
    pub fn new(ctx: Arc<EngineContext>, runner: Arc<TaskRunner>, backoff: Duration) -> Self {
        Self {
            ctx,
            runner,
            backoff,
        }
    }

    /// Re-arm every policy and every retained backup from stored records.
    ///
    /// An occurrence missed while the process was down fires once right
    /// away; retention deletions that are already overdue fire right away.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let store = &self.ctx.store;
        let mut runs = 0;
        let mut deletions = 0;

        for policy in store.list_policies().await? {
            if policy.active_task_id.is_some() {
                store.set_policy_active_task(policy.id, None).await?;
            }

            match self.schedule_recurring(&policy).await {
                Ok(Some(_)) => runs += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        policy_id = policy.id,
                        error = %format!("{:#}", e),
                        "could not schedule policy"
                    )
                }
            }

            if policy.retention_days.is_some() {
                for backup in store.list_backups_for_policy(policy.id).await? {
                    if self.schedule_deletion(&policy, &backup).is_some() {
                        deletions += 1;
                    }
                }
            }
        }

        info!(runs, deletions, "scheduler restored timers");
        Ok(())
    }

    /// Arm the next run of `policy` after its last run, or after its creation if it never ran.
    ///
    /// Returns the armed time, or `None` when the expression has no further
    /// occurrences and the policy goes dormant.
    pub async fn schedule_recurring(
        self: &Arc<Self>,
        policy: &BackupPolicy,
    ) -> Result<Option<DateTime<Utc>>> {
        let store = &self.ctx.store;
        let after = policy.last_backup_at.unwrap_or(policy.created_at);
        let Some(due) = next_occurrence(&policy.cron_expression, after)? else {
            self.clear_scheduled_run(policy.id);
            store.set_policy_next_run(policy.id, None).await?;
            info!(policy_id = policy.id, "policy has no further occurrences");
            return Ok(None);
        };

        let fire = self.recurring_fire(policy.id);
        self.ctx.timers.arm_run(policy.id, delay_until(due), fire);
        store.set_policy_next_run(policy.id, Some(due)).await?;
        debug!(policy_id = policy.id, %due, "scheduled recurring backup");
        Ok(Some(due))
    }

    /// Arm removal of `backup` once the policy's retention has passed since it finished.
    pub fn schedule_deletion(
        self: &Arc<Self>,
        policy: &BackupPolicy,
        backup: &Backup,
    ) -> Option<DateTime<Utc>> {
        let days = policy.retention_days?;
        let retention = chrono::Duration::days(i64::from(days));
        let due = backup.finished_at.checked_add_signed(retention)?;

        let delay = delay_until(due);
        let fire = self.deletion_fire(policy.id, backup.id);
        self.ctx.timers.arm_deletion(backup.id, delay, fire);
        debug!(policy_id = policy.id, backup_id = backup.id, %due, "scheduled backup deletion");
        Some(due)
    }

    pub fn clear_scheduled_run(&self, policy_id: PolicyId) -> bool {
        self.ctx.timers.clear_run(policy_id)
    }

    pub fn clear_scheduled_deletion(&self, backup_id: BackupId) -> bool {
        self.ctx.timers.clear_deletion(backup_id)
    }

    /// Delete a policy and every timer armed on its behalf. Its backups are kept.
    pub async fn delete_policy(&self, policy_id: PolicyId) -> Result<bool> {
        let store = &self.ctx.store;
        if store.get_policy(policy_id).await?.is_none() {
            return Ok(false);
        }

        for backup in store.list_backups_for_policy(policy_id).await? {
            self.clear_scheduled_deletion(backup.id);
        }
        self.clear_scheduled_run(policy_id);
        store.delete_policy(policy_id).await?;

        info!(policy_id, "backup policy deleted");
        Ok(true)
    }

    fn recurring_fire(self: &Arc<Self>, policy_id: PolicyId) -> BoxFuture<'static, ()> {
        let scheduler = Arc::clone(self);
        async move { scheduler.fire_recurring(policy_id).await }.boxed()
    }

    fn deletion_fire(
        self: &Arc<Self>,
        policy_id: PolicyId,
        backup_id: BackupId,
    ) -> BoxFuture<'static, ()> {
        let scheduler = Arc::clone(self);
        async move { scheduler.fire_deletion(policy_id, backup_id).await }.boxed()
    }

    fn follow_up(
        self: &Arc<Self>,
        policy_id: PolicyId,
        handle: TaskHandle,
    ) -> BoxFuture<'static, ()> {
        let scheduler = Arc::clone(self);
        async move { scheduler.after_scheduled_backup(policy_id, handle).await }.boxed()
    }

    fn retry_run(self: &Arc<Self>, policy_id: PolicyId) {
        let fire = self.recurring_fire(policy_id);
        self.ctx.timers.arm_run(policy_id, self.backoff, fire);
    }

    fn retry_deletion(self: &Arc<Self>, policy_id: PolicyId, backup_id: BackupId) {
        let fire = self.deletion_fire(policy_id, backup_id);
        self.ctx.timers.arm_deletion(backup_id, self.backoff, fire);
    }

    async fn fire_recurring(self: &Arc<Self>, policy_id: PolicyId) {
        if let Err(e) = self.start_scheduled_backup(policy_id).await {
            error!(policy_id, error = %format!("{:#}", e), "scheduled backup could not be started");
            self.retry_run(policy_id);
        }
    }

    async fn start_scheduled_backup(self: &Arc<Self>, policy_id: PolicyId) -> Result<()> {
        let store = &self.ctx.store;
        let Some(policy) = store.get_policy(policy_id).await? else {
            debug!(policy_id, "policy was deleted, dropping scheduled run");
            return Ok(());
        };

        let database_id = policy.database_id;
        let active = policy.active_task_id;
        if self.has_conflict(database_id, active).await? {
            info!(
                policy_id,
                backoff_secs = self.backoff.as_secs(),
                "database busy, retrying scheduled backup later"
            );
            self.retry_run(policy_id);
            return Ok(());
        }

        let executor = BackupExecutor::scheduled(Arc::clone(&self.ctx), policy.mode, policy.id);
        let admission = self
            .runner
            .start_task(database_id, TaskType::ScheduledBackup, Box::new(executor))
            .await?;
        match admission {
            Admission::Accepted { task_id, handle } => {
                store.set_policy_active_task(policy_id, Some(task_id)).await?;
                info!(policy_id, task_id, "scheduled backup started");
                tokio::spawn(self.follow_up(policy_id, handle));
            }
            Admission::Rejected(RejectReason::Busy) => self.retry_run(policy_id),
            Admission::Rejected(RejectReason::DatabaseNotFound) => {
                warn!(policy_id, database_id, "policy database no longer exists");
            }
        }
        Ok(())
    }

    async fn after_scheduled_backup(self: &Arc<Self>, policy_id: PolicyId, handle: TaskHandle) {
        let completion = match handle.wait().await {
            Ok(completion) => Some(completion),
            Err(e) => {
                error!(policy_id, error = %format!("{:#}", e), "lost track of scheduled backup");
                None
            }
        };

        if let Err(e) = self.finish_scheduled_run(policy_id, completion).await {
            error!(
                policy_id,
                error = %format!("{:#}", e),
                "could not re-arm policy after its backup"
            );
            self.retry_run(policy_id);
        }
    }

    /// Record the run whatever its outcome so the next occurrence moves forward.
    async fn finish_scheduled_run(
        self: &Arc<Self>,
        policy_id: PolicyId,
        completion: Option<TaskCompletion>,
    ) -> Result<()> {
        let store = &self.ctx.store;
        let Some(mut policy) = store.get_policy(policy_id).await? else {
            return Ok(());
        };
        store.set_policy_active_task(policy_id, None).await?;

        if let Some(TaskCompletion {
            state: TaskState::Successful,
            backup_id: Some(backup_id),
            ..
        }) = completion
        {
            if let Some(backup) = store.get_backup(backup_id).await? {
                self.schedule_deletion(&policy, &backup);
            }
        }

        let ran_at = Utc::now();
        store.record_policy_run(policy_id, ran_at).await?;
        policy.last_backup_at = Some(ran_at);
        policy.active_task_id = None;
        self.schedule_recurring(&policy).await?;
        Ok(())
    }

    async fn fire_deletion(self: &Arc<Self>, policy_id: PolicyId, backup_id: BackupId) {
        if let Err(e) = self.start_scheduled_deletion(policy_id, backup_id).await {
            error!(
                policy_id,
                backup_id,
                error = %format!("{:#}", e),
                "scheduled deletion could not be started"
            );
            self.retry_deletion(policy_id, backup_id);
        }
    }

    async fn start_scheduled_deletion(
        self: &Arc<Self>,
        policy_id: PolicyId,
        backup_id: BackupId,
    ) -> Result<()> {
        let store = &self.ctx.store;
        let Some(policy) = store.get_policy(policy_id).await? else {
            debug!(
                policy_id,
                backup_id,
                "policy was deleted, dropping scheduled deletion"
            );
            return Ok(());
        };
        let Some(backup) = store.get_backup(backup_id).await? else {
            debug!(backup_id, "backup already deleted");
            return Ok(());
        };
        let Some(database_id) = backup.database_id else {
            delete_backups(&self.ctx, &[backup_id], None).await?;
            return Ok(());
        };

        let active = policy.active_task_id;
        if self.has_conflict(database_id, active).await? {
            info!(
                policy_id,
                backup_id,
                backoff_secs = self.backoff.as_secs(),
                "database busy, retrying backup deletion later"
            );
            self.retry_deletion(policy_id, backup_id);
            return Ok(());
        }

        let executor = DeleteBackupExecutor::new(Arc::clone(&self.ctx), vec![backup_id]);
        match self
            .runner
            .start_task(database_id, TaskType::DeleteBackup, Box::new(executor))
            .await?
        {
            Admission::Accepted { task_id, .. } => {
                info!(policy_id, backup_id, task_id, "retention deletion started");
            }
            Admission::Rejected(RejectReason::Busy) => self.retry_deletion(policy_id, backup_id),
            Admission::Rejected(RejectReason::DatabaseNotFound) => {
                delete_backups(&self.ctx, &[backup_id], None).await?;
            }
        }
        Ok(())
    }

    /// The policy's own task is still running, or anything else holds the database.
    async fn has_conflict(
        &self,
        database_id: DatabaseId,
        active_task_id: Option<TaskId>,
    ) -> Result<bool> {
        let store = &self.ctx.store;
        if let Some(task_id) = active_task_id {
            if let Some(task) = store.get_task(task_id).await? {
                if !task.is_complete {
                    return Ok(true);
                }
            }
        }
        Ok(!store.find_incomplete_tasks(database_id).await?.is_empty())
    }
}
