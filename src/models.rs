// ABOUTME: Records shared by the task engine, scheduler and store
// ABOUTME: Tasks, backup policies, backups and target database access

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub type DatabaseId = i64;
pub type TaskId = i64;
pub type PolicyId = i64;
pub type BackupId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ScheduledBackup,
    ManualBackup,
    Restore,
    Import,
    DeleteBackup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Successful,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationType {
    NotCancellable,
    SafeToCancel,
    DangerousToCancel,
}

/// User-facing backup mode; see `compression` for the format each maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    Fast,
    Balanced,
    Compact,
    Compatible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskProgress {
    Uncertain { message: String },
    Detailed {
        message: String,
        current: u64,
        total: u64,
        unit_name: String,
    },
}

impl TaskProgress {
    pub fn uncertain(message: impl Into<String>) -> Self {
        TaskProgress::Uncertain {
            message: message.into(),
        }
    }

    pub fn detailed(message: impl Into<String>, current: u64, total: u64, unit_name: &str) -> Self {
        TaskProgress::Detailed {
            message: message.into(),
            current,
            total,
            unit_name: unit_name.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TaskProgress::Uncertain { message } | TaskProgress::Detailed { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub database_id: DatabaseId,
    pub task_type: TaskType,
    pub is_complete: bool,
    pub state: TaskState,
    pub cancellation_type: CancellationType,
    pub cancel_requested: bool,
    pub progress: TaskProgress,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub id: PolicyId,
    pub database_id: DatabaseId,
    pub cron_expression: String,
    /// Days a produced backup is kept; `None` keeps backups forever.
    pub retention_days: Option<u32>,
    pub mode: BackupMode,
    pub created_at: DateTime<Utc>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub active_task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBackupPolicy {
    pub database_id: DatabaseId,
    pub cron_expression: String,
    pub retention_days: Option<u32>,
    pub mode: BackupMode,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCount {
    pub name: String,
    pub documents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub database_name: String,
    pub collections: Vec<CollectionCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: BackupId,
    /// `None` once the database the backup was taken from is gone.
    pub database_id: Option<DatabaseId>,
    pub source: SourceMetadata,
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    pub mode: BackupMode,
    pub policy_id: Option<PolicyId>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBackup {
    pub database_id: Option<DatabaseId>,
    pub source: SourceMetadata,
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    pub mode: BackupMode,
    pub policy_id: Option<PolicyId>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDatabase {
    pub id: DatabaseId,
    pub name: String,
    pub connection_string: String,
    pub database_name: String,
}

/// Read-only connection details handed to an executor for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDatabaseAccess {
    pub id: DatabaseId,
    pub connection_string: String,
    pub database_name: String,
}

impl TargetDatabase {
    pub fn access(&self) -> TargetDatabaseAccess {
        TargetDatabaseAccess {
            id: self.id,
            connection_string: self.connection_string.clone(),
            database_name: self.database_name.clone(),
        }
    }
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ScheduledBackup => "scheduled_backup",
            TaskType::ManualBackup => "manual_backup",
            TaskType::Restore => "restore",
            TaskType::Import => "import",
            TaskType::DeleteBackup => "delete_backup",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            TaskType::ScheduledBackup => "scheduled backup",
            TaskType::ManualBackup => "backup",
            TaskType::Restore => "restore",
            TaskType::Import => "import",
            TaskType::DeleteBackup => "backup deletion",
        }
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "scheduled_backup" => TaskType::ScheduledBackup,
            "manual_backup" => TaskType::ManualBackup,
            "restore" => TaskType::Restore,
            "import" => TaskType::Import,
            "delete_backup" => TaskType::DeleteBackup,
            other => bail!("Unknown task type '{}'", other),
        })
    }
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Running => "running",
            TaskState::Successful => "successful",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "running" => TaskState::Running,
            "successful" => TaskState::Successful,
            "error" => TaskState::Error,
            "cancelled" => TaskState::Cancelled,
            other => bail!("Unknown task state '{}'", other),
        })
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CancellationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationType::NotCancellable => "not_cancellable",
            CancellationType::SafeToCancel => "safe_to_cancel",
            CancellationType::DangerousToCancel => "dangerous_to_cancel",
        }
    }
}

impl FromStr for CancellationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "not_cancellable" => CancellationType::NotCancellable,
            "safe_to_cancel" => CancellationType::SafeToCancel,
            "dangerous_to_cancel" => CancellationType::DangerousToCancel,
            other => bail!("Unknown cancellation type '{}'", other),
        })
    }
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Fast => "fast",
            BackupMode::Balanced => "balanced",
            BackupMode::Compact => "compact",
            BackupMode::Compatible => "compatible",
        }
    }
}

impl FromStr for BackupMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "fast" => BackupMode::Fast,
            "balanced" => BackupMode::Balanced,
            "compact" => BackupMode::Compact,
            "compatible" => BackupMode::Compatible,
            other => bail!(
                "Unknown backup mode '{}' (expected fast, balanced, compact or compatible)",
                other
            ),
        })
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
