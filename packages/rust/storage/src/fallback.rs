//! Primary store with the local file as a safety net.

use async_trait::async_trait;
use tracing::warn;

use catalogsync_shared::{Result, SyncBaseline};

use crate::{BaselineStore, JsonFileStore};

/// Reads prefer the primary and fall back to the local file. Writes always
/// go to the local file first, then to the primary.
pub struct FallbackStore {
    primary: Box<dyn BaselineStore>,
    local: JsonFileStore,
}

impl FallbackStore {
    pub fn new(primary: Box<dyn BaselineStore>, local: JsonFileStore) -> Self {
        Self { primary, local }
    }
}

#[async_trait]
impl BaselineStore for FallbackStore {
    fn name(&self) -> &str {
        self.primary.name()
    }

    /// Never fails: the baseline is a cache and an empty one is valid.
    async fn load(&self) -> Result<SyncBaseline> {
        let primary_err = match self.primary.load().await {
            Ok(baseline) => return Ok(baseline),
            Err(e) => e,
        };
        warn!(store = self.primary.name(), error = %primary_err, "primary load failed, reading local baseline");

        match self.local.load().await {
            Ok(baseline) => Ok(baseline),
            Err(e) => {
                warn!(error = %e, "local baseline unreadable, starting from an empty baseline");
                Ok(SyncBaseline::default())
            }
        }
    }

    /// The local write is best effort. A primary failure is returned.
    async fn save(&self, baseline: &SyncBaseline) -> Result<()> {
        if let Err(e) = self.local.save(baseline).await {
            warn!(path = %self.local.path().display(), error = %e, "local baseline write failed");
        }
        self.primary.save(baseline).await
    }
}
