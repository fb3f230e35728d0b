//! Supabase (PostgREST) baseline store.
//!
//! Rows use the `songs` table layout of earlier deployments plus two
//! columns, `last_edited_time` and `cover_attempt_count`. PostgREST rejects
//! upserts naming unknown columns, so an older table must be altered first:
//! [`schema_sql`] prints both the full DDL and the `ALTER TABLE` upgrade.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use catalogsync_shared::{
    CatalogRecord, CatalogSyncError, RecordId, Result, SupabaseSettings, SyncBaseline,
};

use crate::{BaselineStore, dedup_by_id};

/// User-Agent string for cache requests.
const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

/// Rows per page on full scans.
const SCAN_PAGE_SIZE: usize = 1000;

/// Table holding the single last-sync row.
const SYNC_INFO_TABLE: &str = "sync_info";

/// DDL for the records table named `table` and the `sync_info` table.
///
/// Mixed-case columns are quoted so they match the JSON keys PostgREST
/// receives. The trailing `ALTER TABLE` statements are no-ops on a fresh
/// table and upgrade one created without the edit-time columns.
pub fn schema_sql(table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {table} (
  id BIGINT PRIMARY KEY,
  name TEXT,
  artists JSONB,
  album JSONB,
  url TEXT,
  "picUrl" TEXT,
  "playedCount" BIGINT DEFAULT 0,
  bv_number TEXT,
  creation_time TEXT,
  publish_time TEXT,
  style TEXT,
  last_edited_time TIMESTAMPTZ,
  cover_attempt_count INTEGER DEFAULT 0,
  created_at TIMESTAMP DEFAULT NOW(),
  updated_at TIMESTAMP DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_{table}_bv_number ON {table}(bv_number);
CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table}(name);
CREATE INDEX IF NOT EXISTS idx_{table}_style ON {table}(style);

ALTER TABLE {table} ADD COLUMN IF NOT EXISTS last_edited_time TIMESTAMPTZ;
ALTER TABLE {table} ADD COLUMN IF NOT EXISTS cover_attempt_count INTEGER DEFAULT 0;

CREATE TABLE IF NOT EXISTS {SYNC_INFO_TABLE} (
  id BIGINT PRIMARY KEY,
  last_sync_time TIMESTAMPTZ NOT NULL,
  created_at TIMESTAMP DEFAULT NOW()
);
"#
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArtistRef {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AlbumRef {
    name: String,
}

/// One row of the remote `songs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SongRow {
    id: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    artists: Option<Vec<ArtistRef>>,
    #[serde(default)]
    album: Option<AlbumRef>,
    #[serde(default)]
    url: Option<String>,
    #[serde(rename = "picUrl", default)]
    pic_url: Option<String>,
    #[serde(rename = "playedCount", default)]
    played_count: Option<i64>,
    #[serde(default)]
    bv_number: Option<String>,
    #[serde(default)]
    creation_time: Option<String>,
    #[serde(default)]
    publish_time: Option<String>,
    #[serde(default)]
    style: Option<String>,
    #[serde(default)]
    last_edited_time: Option<DateTime<Utc>>,
    #[serde(default)]
    cover_attempt_count: Option<i64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl SongRow {
    /// `None` for records without a stable id: they have no remote key.
    fn from_record(record: &CatalogRecord) -> Option<Self> {
        let id = record.id.stable()?;
        Some(Self {
            id,
            name: Some(record.title.clone()),
            artists: Some(
                record
                    .creator_name
                    .iter()
                    .map(|name| ArtistRef { name: name.clone() })
                    .collect(),
            ),
            album: record
                .original_work_name
                .as_ref()
                .map(|name| AlbumRef { name: name.clone() }),
            url: record.external_url.clone(),
            pic_url: record.cover_url.clone(),
            played_count: Some(i64::try_from(record.play_count).unwrap_or(i64::MAX)),
            bv_number: record.source_ref.clone(),
            creation_time: record.era_label.clone(),
            publish_time: record.publish_date.map(|d| d.format("%Y-%m-%d").to_string()),
            style: record.style.clone(),
            last_edited_time: record.last_edited_at,
            cover_attempt_count: Some(i64::from(record.cover_fetch_attempts)),
        })
    }

    fn into_record(self) -> CatalogRecord {
        CatalogRecord {
            id: RecordId::Stable(self.id),
            title: self.name.unwrap_or_default(),
            creator_name: self
                .artists
                .and_then(|a| a.into_iter().next())
                .map(|a| a.name),
            source_ref: non_empty(self.bv_number),
            original_work_name: self.album.map(|a| a.name),
            external_url: non_empty(self.url),
            cover_url: non_empty(self.pic_url),
            play_count: self.played_count.map_or(0, |n| n.max(0) as u64),
            style: non_empty(self.style),
            era_label: non_empty(self.creation_time),
            publish_date: self
                .publish_time
                .as_deref()
                .and_then(|s| s.get(..10))
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
            last_edited_at: self.last_edited_time,
            cover_fetch_attempts: self
                .cover_attempt_count
                .map_or(0, |n| n.clamp(0, i64::from(u8::MAX)) as u8),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncInfoRow {
    id: i64,
    last_sync_time: DateTime<Utc>,
}

/// Baseline store on a Supabase project's REST endpoint.
pub struct SupabaseStore {
    client: Client,
    rest_url: Url,
    api_key: String,
    table: String,
    batch_size: usize,
}

impl SupabaseStore {
    pub fn new(settings: &SupabaseSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CatalogSyncError::Network(format!("failed to build HTTP client: {e}")))?;

        let rest_url = settings
            .url
            .join("rest/v1/")
            .map_err(|e| CatalogSyncError::config(format!("invalid supabase url: {e}")))?;

        Ok(Self {
            client,
            rest_url,
            api_key: settings.api_key.clone(),
            table: settings.table.clone(),
            batch_size: settings.batch_size,
        })
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.rest_url
            .join(table)
            .map_err(|e| CatalogSyncError::config(format!("invalid table name {table}: {e}")))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| CatalogSyncError::Storage(format!("supabase {what}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CatalogSyncError::Storage(format!(
            "supabase {what}: HTTP {status}: {body}"
        )))
    }

    async fn scan_rows(&self) -> Result<Vec<SongRow>> {
        let url = self.table_url(&self.table)?;
        let mut rows = Vec::new();
        let mut offset = 0usize;

        loop {
            let request = self.client.get(url.clone()).query(&[
                ("select", "*".to_string()),
                ("order", "id.asc".to_string()),
                ("offset", offset.to_string()),
                ("limit", SCAN_PAGE_SIZE.to_string()),
            ]);
            let page: Vec<SongRow> = self
                .send(request, "scan")
                .await?
                .json()
                .await
                .map_err(|e| CatalogSyncError::Storage(format!("supabase scan: {e}")))?;

            let fetched = page.len();
            rows.extend(page);
            debug!(offset, fetched, "scanned supabase page");

            if fetched < SCAN_PAGE_SIZE {
                break;
            }
            offset += SCAN_PAGE_SIZE;
        }

        Ok(rows)
    }

    async fn read_last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let request = self
            .client
            .get(self.table_url(SYNC_INFO_TABLE)?)
            .query(&[("select", "id,last_sync_time"), ("id", "eq.1")]);
        let rows: Vec<SyncInfoRow> = self
            .send(request, "read sync_info")
            .await?
            .json()
            .await
            .map_err(|e| CatalogSyncError::Storage(format!("supabase read sync_info: {e}")))?;
        Ok(rows.into_iter().next().map(|r| r.last_sync_time))
    }

    async fn upsert<T: Serialize + Sync>(&self, table: &str, rows: &[T]) -> Result<()> {
        let request = self
            .client
            .post(self.table_url(table)?)
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(rows);
        self.send(request, &format!("upsert {table}")).await?;
        Ok(())
    }
}

#[async_trait]
impl BaselineStore for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn load(&self) -> Result<SyncBaseline> {
        let rows = self.scan_rows().await?;

        let last_sync = match self.read_last_sync().await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, "could not read last sync time");
                None
            }
        };

        info!(records = rows.len(), "loaded baseline from supabase");
        Ok(SyncBaseline {
            records: rows.into_iter().map(SongRow::into_record).collect(),
            last_sync,
        })
    }

    async fn save(&self, baseline: &SyncBaseline) -> Result<()> {
        let records = dedup_by_id(&baseline.records);
        let rows: Vec<SongRow> = records.iter().filter_map(SongRow::from_record).collect();

        let skipped = records.len() - rows.len();
        if skipped > 0 {
            warn!(skipped, "records without a stable id are not sent to supabase");
        }

        for (batch, chunk) in rows.chunks(self.batch_size).enumerate() {
            self.upsert(&self.table, chunk).await?;
            debug!(batch, rows = chunk.len(), "upserted batch");
        }

        if let Some(last_sync_time) = baseline.last_sync {
            let info = [SyncInfoRow {
                id: 1,
                last_sync_time,
            }];
            if let Err(e) = self.upsert(SYNC_INFO_TABLE, &info).await {
                warn!(error = %e, "failed to record sync time");
            }
        }

        info!(rows = rows.len(), "saved baseline to supabase");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    /// Every column the remote table must have for a save to succeed.
    const SONG_COLUMNS: [&str; 13] = [
        "id",
        "name",
        "artists",
        "album",
        "url",
        "picUrl",
        "playedCount",
        "bv_number",
        "creation_time",
        "publish_time",
        "style",
        "last_edited_time",
        "cover_attempt_count",
    ];

    fn store_for(server: &MockServer, batch_size: usize) -> SupabaseStore {
        let settings = SupabaseSettings {
            url: Url::parse(&format!("{}/", server.uri())).expect("url"),
            api_key: "anon-key".into(),
            table: "songs".into(),
            batch_size,
        };
        SupabaseStore::new(&settings).expect("store")
    }

    #[tokio::test]
    async fn load_pages_and_maps_rows() {
        let server = MockServer::start().await;
        let first_page: Vec<_> = (0..SCAN_PAGE_SIZE as i64)
            .map(|i| json!({"id": i, "name": format!("song {i}")}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/rest/v1/songs"))
            .and(query_param("offset", "0"))
            .and(header("apikey", "anon-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/songs"))
            .and(query_param("offset", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": 32735454,
                "name": "青花瓷",
                "artists": [{"name": "小明"}],
                "album": {"name": "原曲"},
                "url": "https://www.bilibili.com/video/BV1GJ411x7h7",
                "picUrl": "",
                "playedCount": 12,
                "bv_number": "BV1GJ411x7h7",
                "publish_time": "2023-10-28",
                "cover_attempt_count": 3
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/sync_info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "last_sync_time": "2024-03-01T10:00:00Z"}
            ])))
            .mount(&server)
            .await;

        let baseline = store_for(&server, 500).load().await.expect("load");
        assert_eq!(baseline.len(), SCAN_PAGE_SIZE + 1);
        assert!(baseline.last_sync.is_some());

        let last = baseline.find("BV1GJ411x7h7").expect("mapped row");
        assert_eq!(last.id, RecordId::Stable(32735454));
        assert_eq!(last.creator_name.as_deref(), Some("小明"));
        assert_eq!(last.cover_url, None);
        assert_eq!(last.cover_fetch_attempts, 3);
        assert_eq!(last.publish_date, NaiveDate::from_ymd_opt(2023, 10, 28));
    }

    #[tokio::test]
    async fn missing_sync_info_is_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/songs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/sync_info"))
            .respond_with(ResponseTemplate::new(404).set_body_string("relation does not exist"))
            .mount(&server)
            .await;

        let baseline = store_for(&server, 500).load().await.expect("load");
        assert!(baseline.is_empty());
        assert_eq!(baseline.last_sync, None);
    }

    #[tokio::test]
    async fn save_dedups_batches_and_skips_unidentified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/songs"))
            .and(query_param("on_conflict", "id"))
            .and(header("prefer", "resolution=merge-duplicates"))
            .respond_with(ResponseTemplate::new(201))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/sync_info"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let mut baseline = SyncBaseline::new(vec![
            CatalogRecord::new("a old", Some("BV1aaaaaaaaa".into())),
            CatalogRecord::new("b", Some("BV1bbbbbbbbb".into())),
            CatalogRecord::new("loose", None),
            CatalogRecord::new("a new", Some("BV1aaaaaaaaa".into())),
            CatalogRecord::new("c", Some("BV1ccccccccc".into())),
        ]);
        baseline.last_sync = Some(Utc::now());

        store_for(&server, 2).save(&baseline).await.expect("save");

        let requests: Vec<Request> = server.received_requests().await.expect("recorded");
        let sent: Vec<SongRow> = requests
            .iter()
            .filter(|r| r.url.path() == "/rest/v1/songs")
            .flat_map(|r| serde_json::from_slice::<Vec<SongRow>>(&r.body).expect("rows"))
            .collect();
        let names: Vec<_> = sent.iter().filter_map(|r| r.name.as_deref()).collect();
        assert_eq!(names, ["a new", "b", "c"]);
    }

    #[tokio::test]
    async fn saved_rows_name_exactly_the_schema_columns() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/songs"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let mut record = CatalogRecord::new("a", Some("BV1aaaaaaaaa".into()));
        record.last_edited_at = Some(Utc::now());
        store_for(&server, 500)
            .save(&SyncBaseline::new(vec![record]))
            .await
            .expect("save");

        let requests: Vec<Request> = server.received_requests().await.expect("recorded");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json");
        let mut keys: Vec<&str> = body[0]
            .as_object()
            .expect("row object")
            .keys()
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        let mut expected = SONG_COLUMNS.to_vec();
        expected.sort_unstable();
        assert_eq!(keys, expected);

        let ddl = schema_sql("songs");
        for column in SONG_COLUMNS {
            assert!(ddl.contains(column), "schema lacks {column}");
        }
        assert!(ddl.contains("ALTER TABLE songs ADD COLUMN IF NOT EXISTS last_edited_time"));
        assert!(ddl.contains("ALTER TABLE songs ADD COLUMN IF NOT EXISTS cover_attempt_count"));
    }

    #[tokio::test]
    async fn upsert_failure_is_storage_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/songs"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let baseline = SyncBaseline::new(vec![CatalogRecord::new("a", Some("BV1aaaaaaaaa".into()))]);
        let err = store_for(&server, 500).save(&baseline).await.unwrap_err();
        assert!(matches!(err, CatalogSyncError::Storage(_)));
        assert!(err.to_string().contains("boom"));
    }
}
