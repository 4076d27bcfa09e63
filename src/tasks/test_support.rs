// ABOUTME: Shared fixtures for executor and scheduler tests
// ABOUTME: Fake inspector, throwaway tool scripts and an in-memory engine context

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::compression::CompressionNegotiator;
use crate::config::ToolsConfig;
use crate::engine::EngineContext;
use crate::inspect::DatabaseInspector;
use crate::models::{
    CancellationType, CollectionCount, TargetDatabase, TargetDatabaseAccess, TaskId,
};
use crate::process::ProcessRunner;
use crate::scheduler::ScheduleTimers;
use crate::store::{SqliteStore, Store};

pub(crate) struct FakeInspector {
    pub collections: Vec<CollectionCount>,
}

#[async_trait]
impl DatabaseInspector for FakeInspector {
    async fn list_collections(
        &self,
        _target: &TargetDatabaseAccess,
    ) -> Result<Vec<CollectionCount>> {
        Ok(self.collections.clone())
    }
}

/// Tools that do not exist; tests override the ones they exercise.
pub(crate) fn fake_tools(dir: &Path) -> ToolsConfig {
    let missing = |name: &str| {
        let path = dir.join(format!("missing-{}", name));
        path.to_string_lossy().into_owned()
    };
    ToolsConfig {
        mongodump: missing("mongodump"),
        mongorestore: missing("mongorestore"),
        mongosh: missing("mongosh"),
        zstd: missing("zstd"),
    }
}

#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

pub(crate) fn test_context(dir: &Path, tools: ToolsConfig) -> Arc<EngineContext> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    Arc::new(EngineContext {
        store,
        processes: ProcessRunner::new(Duration::from_millis(20)),
        compression: CompressionNegotiator::new(tools.zstd.clone()),
        inspector: Arc::new(FakeInspector {
            collections: vec![CollectionCount {
                name: "users".into(),
                documents: 10,
            }],
        }),
        tools,
        backup_dir: dir.join("backups"),
        timers: Arc::new(ScheduleTimers::default()),
    })
}

pub(crate) async fn add_database(ctx: &EngineContext) -> TargetDatabase {
    ctx.store
        .insert_database("primary", "mongodb://localhost:27017", "app_restore")
        .await
        .unwrap()
}

pub(crate) async fn wait_for_cancellation_type(
    ctx: &EngineContext,
    task_id: TaskId,
    expected: CancellationType,
) {
    for _ in 0..200 {
        let task = ctx.store.get_task(task_id).await.unwrap().unwrap();
        if task.cancellation_type == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached {:?}", task_id, expected);
}
