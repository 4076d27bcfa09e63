// ABOUTME: Enumerates collections and estimated document counts of a target database
// ABOUTME: The default implementation asks mongosh and parses its JSON output

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::error::EngineError;
use crate::models::{CollectionCount, TargetDatabaseAccess};
use crate::process::{OutputStream, ProcessOutcome, ProcessRunner, ProcessSpec};

#[async_trait]
pub trait DatabaseInspector: Send + Sync {
    async fn list_collections(
        &self,
        target: &TargetDatabaseAccess,
    ) -> Result<Vec<CollectionCount>>;
}

pub struct MongoShellInspector {
    runner: ProcessRunner,
    program: String,
}

impl MongoShellInspector {
    pub fn new(runner: ProcessRunner, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    fn command(&self, target: &TargetDatabaseAccess) -> Result<ProcessSpec> {
        let database = serde_json::to_string(&target.database_name)
            .context("Invalid database name")?;
        let script = format!(
            "const target = db.getSiblingDB({database}); \
             print(JSON.stringify(target.getCollectionInfos({{ type: 'collection' }}) \
             .map(c => ({{ name: c.name, \
             documents: target.getCollection(c.name).estimatedDocumentCount() }}))));"
        );

        Ok(ProcessSpec::new(&self.program).args([
            target.connection_string.as_str(),
            "--quiet",
            "--norc",
            "--eval",
            script.as_str(),
        ]))
    }
}

#[async_trait]
impl DatabaseInspector for MongoShellInspector {
    async fn list_collections(
        &self,
        target: &TargetDatabaseAccess,
    ) -> Result<Vec<CollectionCount>> {
        let spec = self.command(target)?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let outcome = self
            .runner
            .run(
                std::slice::from_ref(&spec),
                |chunk| match chunk.stream {
                    OutputStream::Stdout => stdout.extend(chunk.bytes),
                    OutputStream::Stderr => stderr.extend(chunk.bytes),
                },
                None,
            )
            .await;

        match outcome {
            ProcessOutcome::Success => {
                parse_collection_listing(&String::from_utf8_lossy(&stdout))
            }
            ProcessOutcome::Failure(failure) => Err(EngineError::Process(format!(
                "{}: {}",
                failure,
                String::from_utf8_lossy(&stderr).trim()
            ))
            .into()),
            ProcessOutcome::Cancelled => Err(EngineError::Cancelled.into()),
        }
    }
}

/// The listing is the last non-empty line; mongosh may print warnings first.
pub fn parse_collection_listing(output: &str) -> Result<Vec<CollectionCount>> {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .context("mongosh printed no collection listing")?;

    let mut collections: Vec<CollectionCount> = serde_json::from_str(line)
        .with_context(|| format!("Unexpected collection listing: {}", line))?;
    collections.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(collections)
}
