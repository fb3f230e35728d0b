//! Local JSON baseline file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use catalogsync_shared::{CatalogSyncError, Result, SyncBaseline};

use crate::{BaselineStore, dedup_by_id};

/// Whole-file baseline store. Writes go to a temp file that is renamed over
/// the target, so a crash never leaves a half-written baseline behind.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl BaselineStore for JsonFileStore {
    fn name(&self) -> &str {
        "local-file"
    }

    async fn load(&self) -> Result<SyncBaseline> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no local baseline yet");
                return Ok(SyncBaseline::default());
            }
            Err(e) => return Err(CatalogSyncError::io(&self.path, e)),
        };

        serde_json::from_str(&content).map_err(|e| {
            CatalogSyncError::Storage(format!("corrupt baseline {}: {e}", self.path.display()))
        })
    }

    async fn save(&self, baseline: &SyncBaseline) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CatalogSyncError::io(parent, e))?;
        }

        let snapshot = SyncBaseline {
            records: dedup_by_id(&baseline.records),
            last_sync: baseline.last_sync,
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| CatalogSyncError::Storage(e.to_string()))?;

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| CatalogSyncError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CatalogSyncError::io(&self.path, e))?;

        debug!(path = %self.path.display(), records = snapshot.records.len(), "wrote local baseline");
        Ok(())
    }
}
