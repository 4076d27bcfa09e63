// ABOUTME: SQLite implementation of the Store trait using rusqlite
// ABOUTME: Creates its schema on open and keeps one connection behind a mutex

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use super::Store;
use crate::models::{
    Backup, BackupId, BackupPolicy, CancellationType, DatabaseId, NewBackup, NewBackupPolicy,
    PolicyId, TargetDatabase, Task, TaskId, TaskProgress, TaskState, TaskType,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS databases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    connection_string TEXT NOT NULL,
    database_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    database_id INTEGER NOT NULL,
    task_type TEXT NOT NULL,
    is_complete INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    cancellation_type TEXT NOT NULL,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    progress TEXT NOT NULL,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS tasks_incomplete ON tasks (database_id, is_complete);

CREATE TABLE IF NOT EXISTS policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    database_id INTEGER NOT NULL REFERENCES databases (id) ON DELETE CASCADE,
    cron_expression TEXT NOT NULL,
    retention_days INTEGER,
    mode TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_backup_at TEXT,
    next_run_at TEXT,
    active_task_id INTEGER
);

CREATE TABLE IF NOT EXISTS backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    database_id INTEGER REFERENCES databases (id) ON DELETE SET NULL,
    source TEXT NOT NULL,
    archive_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    mode TEXT NOT NULL,
    policy_id INTEGER REFERENCES policies (id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    finished_at TEXT NOT NULL
);
";

const TASK_COLUMNS: &str = "id, database_id, task_type, is_complete, state, cancellation_type, \
     cancel_requested, progress, started_at, updated_at, completed_at";

const POLICY_COLUMNS: &str = "id, database_id, cron_expression, retention_days, mode, created_at, \
     last_backup_at, next_run_at, active_task_id";

const BACKUP_COLUMNS: &str = "id, database_id, source, archive_path, size_bytes, mode, policy_id, \
     created_at, finished_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory store")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Store connection lock was poisoned"))
    }
}

fn parse_text<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    value
        .parse()
        .map_err(|e: anyhow::Error| conversion_failure(idx, e.into()))
}

fn parse_json<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_str(&value).map_err(|e| conversion_failure(idx, Box::new(e)))
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn conversion_failure(idx: usize, err: BoxError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err)
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        database_id: row.get(1)?,
        task_type: parse_text(2, row.get(2)?)?,
        is_complete: row.get(3)?,
        state: parse_text(4, row.get(4)?)?,
        cancellation_type: parse_text(5, row.get(5)?)?,
        cancel_requested: row.get(6)?,
        progress: parse_json(7, row.get(7)?)?,
        started_at: row.get(8)?,
        updated_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

fn policy_from_row(row: &Row<'_>) -> rusqlite::Result<BackupPolicy> {
    Ok(BackupPolicy {
        id: row.get(0)?,
        database_id: row.get(1)?,
        cron_expression: row.get(2)?,
        retention_days: row.get(3)?,
        mode: parse_text(4, row.get(4)?)?,
        created_at: row.get(5)?,
        last_backup_at: row.get(6)?,
        next_run_at: row.get(7)?,
        active_task_id: row.get(8)?,
    })
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<Backup> {
    let archive_path: String = row.get(3)?;
    let size_bytes: i64 = row.get(4)?;
    Ok(Backup {
        id: row.get(0)?,
        database_id: row.get(1)?,
        source: parse_json(2, row.get(2)?)?,
        archive_path: PathBuf::from(archive_path),
        size_bytes: size_bytes.max(0) as u64,
        mode: parse_text(5, row.get(5)?)?,
        policy_id: row.get(6)?,
        created_at: row.get(7)?,
        finished_at: row.get(8)?,
    })
}

fn database_from_row(row: &Row<'_>) -> rusqlite::Result<TargetDatabase> {
    Ok(TargetDatabase {
        id: row.get(0)?,
        name: row.get(1)?,
        connection_string: row.get(2)?,
        database_name: row.get(3)?,
    })
}

fn progress_json(progress: &TaskProgress) -> Result<String> {
    serde_json::to_string(progress).context("Failed to serialize task progress")
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_database(
        &self,
        name: &str,
        connection_string: &str,
        database_name: &str,
    ) -> Result<TargetDatabase> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO databases (name, connection_string, database_name) VALUES (?1, ?2, ?3)",
            params![name, connection_string, database_name],
        )
        .context("Failed to insert database")?;

        Ok(TargetDatabase {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            connection_string: connection_string.to_string(),
            database_name: database_name.to_string(),
        })
    }

    async fn get_database(&self, id: DatabaseId) -> Result<Option<TargetDatabase>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, connection_string, database_name FROM databases WHERE id = ?1",
            params![id],
            database_from_row,
        )
        .optional()
        .context("Failed to load database")
    }

    async fn list_databases(&self) -> Result<Vec<TargetDatabase>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, connection_string, database_name FROM databases ORDER BY id",
        )?;
        let rows = stmt.query_map([], database_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list databases")
    }

    async fn insert_task_if_idle(
        &self,
        database_id: DatabaseId,
        task_type: TaskType,
        progress: &TaskProgress,
    ) -> Result<Option<Task>> {
        let progress_text = progress_json(progress)?;
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("Failed to begin admission transaction")?;

        let busy: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks WHERE database_id = ?1 AND is_complete = 0",
            params![database_id],
            |row| row.get(0),
        )?;
        if busy > 0 {
            return Ok(None);
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO tasks (database_id, task_type, is_complete, state, cancellation_type,
                                cancel_requested, progress, started_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, 0, ?5, ?6, ?6)",
            params![
                database_id,
                task_type.as_str(),
                TaskState::Running.as_str(),
                CancellationType::NotCancellable.as_str(),
                progress_text,
                now,
            ],
        )
        .context("Failed to insert task")?;
        let id = tx.last_insert_rowid();
        tx.commit()
            .context("Failed to commit admission transaction")?;

        Ok(Some(Task {
            id,
            database_id,
            task_type,
            is_complete: false,
            state: TaskState::Running,
            cancellation_type: CancellationType::NotCancellable,
            cancel_requested: false,
            progress: progress.clone(),
            started_at: now,
            updated_at: now,
            completed_at: None,
        }))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            task_from_row,
        )
        .optional()
        .context("Failed to load task")
    }

    async fn list_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks ORDER BY started_at DESC, id DESC LIMIT ?1",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list tasks")
    }

    async fn find_incomplete_tasks(&self, database_id: DatabaseId) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE database_id = ?1 AND is_complete = 0 ORDER BY id",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![database_id], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query incomplete tasks")
    }

    async fn update_task_progress(&self, id: TaskId, progress: &TaskProgress) -> Result<()> {
        let progress_text = progress_json(progress)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET progress = ?2, updated_at = ?3 WHERE id = ?1 AND is_complete = 0",
            params![id, progress_text, Utc::now()],
        )
        .context("Failed to update task progress")?;
        Ok(())
    }

    async fn set_cancellation_type(
        &self,
        id: TaskId,
        cancellation_type: CancellationType,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET cancellation_type = ?2, updated_at = ?3
             WHERE id = ?1 AND is_complete = 0",
            params![id, cancellation_type.as_str(), Utc::now()],
        )
        .context("Failed to update cancellation type")?;
        Ok(())
    }

    async fn request_cancel(&self, id: TaskId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET cancel_requested = 1, updated_at = ?2
             WHERE id = ?1 AND is_complete = 0",
            params![id, Utc::now()],
        )
        .context("Failed to request cancellation")?;
        Ok(())
    }

    async fn complete_task(
        &self,
        id: TaskId,
        state: TaskState,
        progress: &TaskProgress,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(anyhow!("Cannot complete task {} with state {}", id, state));
        }

        let progress_text = progress_json(progress)?;
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks
             SET is_complete = 1, state = ?2, progress = ?3, updated_at = ?4, completed_at = ?4
             WHERE id = ?1 AND is_complete = 0",
            params![id, state.as_str(), progress_text, now],
        )
        .context("Failed to complete task")?;
        Ok(())
    }

    async fn fail_interrupted_tasks(&self, progress: &TaskProgress) -> Result<usize> {
        let progress_text = progress_json(progress)?;
        let now = Utc::now();
        let conn = self.conn()?;
        let touched = conn
            .execute(
                "UPDATE tasks
                 SET is_complete = 1, state = ?1, progress = ?2,
                     updated_at = ?3, completed_at = ?3
                 WHERE is_complete = 0",
                params![TaskState::Error.as_str(), progress_text, now],
            )
            .context("Failed to fail interrupted tasks")?;
        Ok(touched)
    }

    async fn insert_policy(&self, policy: &NewBackupPolicy) -> Result<BackupPolicy> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO policies (database_id, cron_expression, retention_days, mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                policy.database_id,
                policy.cron_expression,
                policy.retention_days,
                policy.mode.as_str(),
                policy.created_at,
            ],
        )
        .context("Failed to insert backup policy")?;

        Ok(BackupPolicy {
            id: conn.last_insert_rowid(),
            database_id: policy.database_id,
            cron_expression: policy.cron_expression.clone(),
            retention_days: policy.retention_days,
            mode: policy.mode,
            created_at: policy.created_at,
            last_backup_at: None,
            next_run_at: None,
            active_task_id: None,
        })
    }

    async fn get_policy(&self, id: PolicyId) -> Result<Option<BackupPolicy>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM policies WHERE id = ?1", POLICY_COLUMNS),
            params![id],
            policy_from_row,
        )
        .optional()
        .context("Failed to load backup policy")
    }

    async fn list_policies(&self) -> Result<Vec<BackupPolicy>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM policies ORDER BY id", POLICY_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], policy_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list backup policies")
    }

    async fn delete_policy(&self, id: PolicyId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM policies WHERE id = ?1", params![id])
            .context("Failed to delete backup policy")?;
        Ok(())
    }

    async fn set_policy_active_task(&self, id: PolicyId, task_id: Option<TaskId>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE policies SET active_task_id = ?2 WHERE id = ?1",
            params![id, task_id],
        )
        .context("Failed to link task to backup policy")?;
        Ok(())
    }

    async fn record_policy_run(&self, id: PolicyId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE policies SET last_backup_at = ?2 WHERE id = ?1",
            params![id, at],
        )
        .context("Failed to record backup policy run")?;
        Ok(())
    }

    async fn set_policy_next_run(&self, id: PolicyId, at: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE policies SET next_run_at = ?2 WHERE id = ?1",
            params![id, at],
        )
        .context("Failed to record next policy run")?;
        Ok(())
    }

    async fn insert_backup(&self, backup: &NewBackup) -> Result<Backup> {
        let source = serde_json::to_string(&backup.source)
            .context("Failed to serialize backup source")?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO backups (database_id, source, archive_path, size_bytes, mode, policy_id,
                                  created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                backup.database_id,
                source,
                backup.archive_path.to_string_lossy(),
                backup.size_bytes as i64,
                backup.mode.as_str(),
                backup.policy_id,
                backup.created_at,
                backup.finished_at,
            ],
        )
        .context("Failed to insert backup")?;

        Ok(Backup {
            id: conn.last_insert_rowid(),
            database_id: backup.database_id,
            source: backup.source.clone(),
            archive_path: backup.archive_path.clone(),
            size_bytes: backup.size_bytes,
            mode: backup.mode,
            policy_id: backup.policy_id,
            created_at: backup.created_at,
            finished_at: backup.finished_at,
        })
    }

    async fn get_backup(&self, id: BackupId) -> Result<Option<Backup>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM backups WHERE id = ?1", BACKUP_COLUMNS),
            params![id],
            backup_from_row,
        )
        .optional()
        .context("Failed to load backup")
    }

    async fn list_backups(&self) -> Result<Vec<Backup>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM backups ORDER BY id", BACKUP_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], backup_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list backups")
    }

    async fn list_backups_for_policy(&self, policy_id: PolicyId) -> Result<Vec<Backup>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM backups WHERE policy_id = ?1 ORDER BY id",
            BACKUP_COLUMNS
        ))?;
        let rows = stmt.query_map(params![policy_id], backup_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list policy backups")
    }

    async fn delete_backup(&self, id: BackupId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM backups WHERE id = ?1", params![id])
            .context("Failed to delete backup")?;
        Ok(())
    }
}
