//! Opens JSON briefcase files.

use super::file::{BriefcaseFile, JsonDatabase};
use crate::database::{DatabaseError, DatabaseOpener, DbResult, LocalDatabase};
use async_trait::async_trait;
use briefcase_engine::{BriefcaseProps, OpenMode};
use std::path::Path;
use std::time::Duration;

/// Opener for [`JsonDatabase`] files.
#[derive(Debug, Clone, Default)]
pub struct JsonOpener {
    /// Artificial latency added to every file access, for exercising timeouts
    open_delay: Option<Duration>,
}

impl JsonOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    async fn delay(&self) {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn read_file(&self, path: &Path) -> DbResult<BriefcaseFile> {
        self.delay().await;
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DatabaseError::NotFound(path.to_path_buf()),
            _ => DatabaseError::from(e),
        })?;
        BriefcaseFile::read(path, &bytes)
    }
}

#[async_trait]
impl DatabaseOpener for JsonOpener {
    async fn open(&self, path: &Path, mode: OpenMode) -> DbResult<Box<dyn LocalDatabase>> {
        let file = self.read_file(path).await?;
        tracing::debug!(path = %path.display(), ?mode, "Opened briefcase file");
        Ok(Box::new(JsonDatabase::new(path, mode, file)))
    }

    async fn create(&self, path: &Path, props: BriefcaseProps) -> DbResult<Box<dyn LocalDatabase>> {
        self.delay().await;
        let file = BriefcaseFile::new(props);
        file.write(path)?;
        tracing::debug!(path = %path.display(), "Created briefcase file");
        Ok(Box::new(JsonDatabase::new(path, OpenMode::ReadWrite, file)))
    }

    async fn read_props(&self, path: &Path) -> DbResult<BriefcaseProps> {
        Ok(self.read_file(path).await?.props)
    }

    async fn copy(&self, source: &Path, target: &Path, props: BriefcaseProps) -> DbResult<()> {
        let mut file = self.read_file(source).await?;
        file.props = props;
        file.unpushed_changes.clear();
        file.unpushed_schemas.clear();
        file.write(target)?;
        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            "Copied briefcase file"
        );
        Ok(())
    }
}
