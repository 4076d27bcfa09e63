// ABOUTME: Chooses a compression format for backups based on tools present on the host
// ABOUTME: Detects zstd once per process and maps backup modes and file extensions to formats

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::models::BackupMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompressionFormat {
    /// Built into mongodump/mongorestore, always available.
    Gzip,
    /// External `zstd` binary piped with the tools.
    Zstd,
}

impl CompressionFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionFormat::Gzip => "gz",
            CompressionFormat::Zstd => "zst",
        }
    }

    /// Whether the dump and restore tools read and write this format themselves.
    pub fn is_native(&self) -> bool {
        matches!(self, CompressionFormat::Gzip)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") => Ok(CompressionFormat::Gzip),
            Some("zst") => Ok(CompressionFormat::Zstd),
            _ => Err(EngineError::UnsupportedFormat(format!(
                "cannot tell the compression of {}",
                path.display()
            ))
            .into()),
        }
    }
}

impl BackupMode {
    pub fn compression_format(&self) -> CompressionFormat {
        match self {
            BackupMode::Fast | BackupMode::Balanced | BackupMode::Compact => {
                CompressionFormat::Zstd
            }
            BackupMode::Compatible => CompressionFormat::Gzip,
        }
    }

    /// zstd level for modes backed by zstd.
    pub fn zstd_level(&self) -> Option<i32> {
        match self {
            BackupMode::Fast => Some(3),
            BackupMode::Balanced => Some(10),
            BackupMode::Compact => Some(19),
            BackupMode::Compatible => None,
        }
    }
}

/// Detects which compression formats this host supports.
///
/// Detection runs at most once per negotiator; a tool installed after the
/// first check is not seen until the process restarts.
pub struct CompressionNegotiator {
    zstd_program: String,
    available: OnceCell<BTreeSet<CompressionFormat>>,
}

impl CompressionNegotiator {
    pub fn new(zstd_program: impl Into<String>) -> Self {
        Self {
            zstd_program: zstd_program.into(),
            available: OnceCell::new(),
        }
    }

    pub fn zstd_program(&self) -> &str {
        &self.zstd_program
    }

    pub async fn available_formats(&self) -> &BTreeSet<CompressionFormat> {
        self.available
            .get_or_init(|| async {
                let mut formats = BTreeSet::from([CompressionFormat::Gzip]);
                if tool_works(&self.zstd_program).await {
                    formats.insert(CompressionFormat::Zstd);
                }
                info!(?formats, "detected available compression formats");
                formats
            })
            .await
    }

    /// Fails with [`EngineError::ToolUnavailable`] when the format cannot be used here.
    pub async fn ensure_supported(&self, format: CompressionFormat) -> Result<()> {
        if self.available_formats().await.contains(&format) {
            Ok(())
        } else {
            Err(EngineError::ToolUnavailable(format!(
                "{} is not installed on this host; {:?} archives cannot be processed",
                self.zstd_program, format
            ))
            .into())
        }
    }

    pub async fn format_for_mode(&self, mode: BackupMode) -> Result<CompressionFormat> {
        let format = mode.compression_format();
        self.ensure_supported(format).await?;
        Ok(format)
    }

    pub fn extension_for_format(format: CompressionFormat) -> &'static str {
        format.extension()
    }

    pub fn format_from_file_extension(path: &Path) -> Result<CompressionFormat> {
        CompressionFormat::from_path(path)
    }
}

async fn tool_works(program: &str) -> bool {
    let path = match which::which(program) {
        Ok(path) => path,
        Err(e) => {
            warn!(program, error = %e, "compression tool not found");
            return false;
        }
    };

    match Command::new(&path)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(program, ?status, "compression tool check failed");
            false
        }
        Err(e) => {
            warn!(program, error = %e, "compression tool could not be started");
            false
        }
    }
}
