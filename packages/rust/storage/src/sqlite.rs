//! Baseline store in a local libSQL database file.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::warn;

use catalogsync_shared::{CatalogRecord, CatalogSyncError, MAX_COVER_ATTEMPTS, Result, SyncBaseline};

use crate::{BaselineStore, dedup_by_id, migrations};

const LAST_SYNC_KEY: &str = "last_sync";

/// Aggregate counts over the stored records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records: u64,
    pub with_cover: u64,
    pub cover_exhausted: u64,
    pub unidentified: u64,
}

impl StoreStats {
    /// Same counts, computed from an in-memory baseline.
    pub fn from_baseline(baseline: &SyncBaseline) -> Self {
        let count = |f: &dyn Fn(&CatalogRecord) -> bool| {
            baseline.records.iter().filter(|r| f(r)).count() as u64
        };
        Self {
            records: baseline.len() as u64,
            with_cover: count(&|r| r.cover_url.is_some()),
            cover_exhausted: count(&|r| r.cover_url.is_none() && r.cover_attempts_exhausted()),
            unidentified: count(&|r| r.source_ref.is_none()),
        }
    }
}

/// Baseline store backed by a local libSQL database.
pub struct SqliteStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

fn storage_err(e: libsql::Error) -> CatalogSyncError {
    CatalogSyncError::Storage(e.to_string())
}

impl SqliteStore {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatalogSyncError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let store = Self { db, conn };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    CatalogSyncError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    /// Record counts for the `stats` command.
    pub async fn stats(&self) -> Result<StoreStats> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(cover_url IS NOT NULL), 0),
                        COALESCE(SUM(cover_url IS NULL AND cover_fetch_attempts >= ?1), 0),
                        COALESCE(SUM(source_ref IS NULL), 0)
                 FROM records",
                params![i64::from(MAX_COVER_ATTEMPTS)],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(StoreStats::default());
        };
        let count = |i: i32| row.get::<i64>(i).map(|v| v.max(0) as u64).map_err(storage_err);
        Ok(StoreStats {
            records: count(0)?,
            with_cover: count(1)?,
            cover_exhausted: count(2)?,
            unidentified: count(3)?,
        })
    }

    /// Time of the last saved sync, without loading any records.
    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![LAST_SYNC_KEY],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let raw: String = row.get(0).map_err(storage_err)?;
                Ok(DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok())
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BaselineStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self) -> Result<SyncBaseline> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_key, record_json FROM records ORDER BY position, record_key",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let key: String = row.get(0).map_err(storage_err)?;
            let json: String = row.get(1).map_err(storage_err)?;
            match serde_json::from_str::<CatalogRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!(record_key = %key, error = %e, "skipping unreadable record row"),
            }
        }

        Ok(SyncBaseline {
            records,
            last_sync: self.last_sync().await?,
        })
    }

    async fn save(&self, baseline: &SyncBaseline) -> Result<()> {
        let records = dedup_by_id(&baseline.records);
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        for (position, record) in records.iter().enumerate() {
            let json = serde_json::to_string(record)
                .map_err(|e| CatalogSyncError::Storage(e.to_string()))?;
            tx.execute(
                "INSERT INTO records (record_key, position, source_ref, title, record_json, updated_at, cover_url, cover_fetch_attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(record_key) DO UPDATE SET
                   position = excluded.position,
                   source_ref = excluded.source_ref,
                   title = excluded.title,
                   record_json = excluded.record_json,
                   updated_at = excluded.updated_at,
                   cover_url = excluded.cover_url,
                   cover_fetch_attempts = excluded.cover_fetch_attempts",
                params![
                    record.id.to_string(),
                    position as i64,
                    record.source_ref.as_deref(),
                    record.title.as_str(),
                    json,
                    now.as_str(),
                    record.cover_url.as_deref(),
                    i64::from(record.cover_fetch_attempts),
                ],
            )
            .await
            .map_err(storage_err)?;
        }

        if let Some(last_sync) = baseline.last_sync {
            tx.execute(
                "INSERT INTO sync_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![LAST_SYNC_KEY, last_sync.to_rfc3339(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }
}
