//! Baseline persistence.
//!
//! A [`BaselineStore`] loads and saves the whole [`SyncBaseline`]. Backends:
//! - [`JsonFileStore`]: local file, whole-file overwrite
//! - [`SqliteStore`]: local libSQL database with migrations
//! - [`SupabaseStore`]: remote PostgREST table, batched upsert
//!
//! [`FallbackStore`] puts a durable backend in front of the local file. The
//! store is a cache: losing it never loses upstream data.

mod fallback;
mod file;
mod migrations;
mod sqlite;
mod supabase;

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{info, warn};

use catalogsync_shared::{
    AppConfig, CacheBackend, CatalogRecord, RecordId, Result, SupabaseSettings, SyncBaseline,
    expand_home,
};

pub use fallback::FallbackStore;
pub use file::JsonFileStore;
pub use sqlite::{SqliteStore, StoreStats};
pub use supabase::{SupabaseStore, schema_sql};

/// Load/save access to the persisted baseline.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    async fn load(&self) -> Result<SyncBaseline>;

    async fn save(&self, baseline: &SyncBaseline) -> Result<()>;
}

/// Keep one record per id. The last-seen value wins and takes the position
/// of the first occurrence.
pub fn dedup_by_id(records: &[CatalogRecord]) -> Vec<CatalogRecord> {
    let mut positions: HashMap<RecordId, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<CatalogRecord> = Vec::with_capacity(records.len());

    for record in records {
        match positions.get(&record.id) {
            Some(&i) => out[i] = record.clone(),
            None => {
                positions.insert(record.id, out.len());
                out.push(record.clone());
            }
        }
    }

    if out.len() < records.len() {
        info!(
            before = records.len(),
            after = out.len(),
            "dropped duplicate record ids before write"
        );
    }
    out
}

/// Build the store selected by `[cache]`.
///
/// The local JSON file is always part of the result. Missing Supabase
/// credentials degrade to the local file alone, since the cache is optional.
pub async fn build_store(config: &AppConfig) -> Result<Box<dyn BaselineStore>> {
    let local = JsonFileStore::new(expand_home(&config.cache.local_path));

    let store: Box<dyn BaselineStore> = match config.cache.backend {
        CacheBackend::Supabase => match SupabaseSettings::resolve(&config.supabase) {
            Ok(settings) => Box::new(FallbackStore::new(
                Box::new(SupabaseStore::new(&settings)?),
                local,
            )),
            Err(e) => {
                warn!(error = %e, "supabase not configured, using local baseline only");
                Box::new(local)
            }
        },
        CacheBackend::Sqlite => {
            let sqlite = SqliteStore::open(&expand_home(&config.cache.sqlite_path)).await?;
            Box::new(FallbackStore::new(Box::new(sqlite), local))
        }
        CacheBackend::None => Box::new(local),
    };

    info!(store = store.name(), "baseline store ready");
    Ok(store)
}
