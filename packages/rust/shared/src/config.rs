//! Application configuration for catalogsync.
//!
//! User config lives at `~/.catalogsync/catalogsync.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets are never stored in the file: the config names the environment
//! variables that hold them, and [`SyncSettings::resolve`] reads those.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CatalogSyncError, Result};
use crate::types::MAX_COVER_ATTEMPTS;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "catalogsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".catalogsync";

// ---------------------------------------------------------------------------
// Config structs (matching catalogsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Upstream Notion source.
    #[serde(default)]
    pub notion: NotionConfig,

    /// Cover lookup (Bilibili).
    #[serde(default)]
    pub covers: CoversConfig,

    /// Sync timing and tolerances.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Baseline persistence.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Supabase remote cache.
    #[serde(default)]
    pub supabase: SupabaseConfig,
}

/// `[notion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotionConfig {
    /// Name of the env var holding the integration token.
    #[serde(default = "default_notion_key_env")]
    pub api_key_env: String,

    /// Database ids to sync. When empty, read from `database_ids_env`.
    #[serde(default)]
    pub database_ids: Vec<String>,

    /// Name of the env var holding comma-separated database ids.
    #[serde(default = "default_database_ids_env")]
    pub database_ids_env: String,

    #[serde(default = "default_notion_base_url")]
    pub base_url: String,

    #[serde(default = "default_notion_version")]
    pub notion_version: String,

    /// Records per query page (Notion maximum is 100).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Pause between page requests, in ms.
    #[serde(default = "default_page_delay")]
    pub page_delay_ms: u64,

    /// Stop after this many pages per database (0 = unlimited).
    #[serde(default)]
    pub max_pages: u32,

    /// Database column names mapped onto record fields.
    #[serde(default)]
    pub fields: FieldNames,
}

impl Default for NotionConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_notion_key_env(),
            database_ids: Vec::new(),
            database_ids_env: default_database_ids_env(),
            base_url: default_notion_base_url(),
            notion_version: default_notion_version(),
            page_size: default_page_size(),
            page_delay_ms: default_page_delay(),
            max_pages: 0,
            fields: FieldNames::default(),
        }
    }
}

fn default_notion_key_env() -> String {
    "NOTION_API_KEY".into()
}
fn default_database_ids_env() -> String {
    "NOTION_DATABASE_IDS".into()
}
fn default_notion_base_url() -> String {
    "https://api.notion.com/v1".into()
}
fn default_notion_version() -> String {
    "2022-06-28".into()
}
fn default_page_size() -> u32 {
    100
}
fn default_page_delay() -> u64 {
    20
}

/// `[notion.fields]`: upstream column name for each record field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNames {
    #[serde(default = "default_title_field")]
    pub title: String,
    #[serde(default = "default_creator_field")]
    pub creator: String,
    #[serde(default = "default_video_url_field")]
    pub video_url: String,
    #[serde(default = "default_original_work_field")]
    pub original_work: String,
    #[serde(default = "default_play_count_field")]
    pub play_count: String,
    #[serde(default = "default_style_field")]
    pub style: String,
    #[serde(default = "default_era_field")]
    pub era: String,
    #[serde(default = "default_publish_date_field")]
    pub publish_date: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            title: default_title_field(),
            creator: default_creator_field(),
            video_url: default_video_url_field(),
            original_work: default_original_work_field(),
            play_count: default_play_count_field(),
            style: default_style_field(),
            era: default_era_field(),
            publish_date: default_publish_date_field(),
        }
    }
}

fn default_title_field() -> String {
    "作品名称".into()
}
fn default_creator_field() -> String {
    "全民制作人".into()
}
fn default_video_url_field() -> String {
    "视频链接".into()
}
fn default_original_work_field() -> String {
    "原曲".into()
}
fn default_play_count_field() -> String {
    "播放量（纯数字）".into()
}
fn default_style_field() -> String {
    "风格".into()
}
fn default_era_field() -> String {
    "创作时代".into()
}
fn default_publish_date_field() -> String {
    "发布时间".into()
}

/// `[covers]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoversConfig {
    /// Set to false to skip cover lookups entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bilibili_base_url")]
    pub base_url: String,

    /// Per-call timeout in ms.
    #[serde(default = "default_cover_timeout")]
    pub timeout_ms: u64,

    /// Lookups in flight at once.
    #[serde(default = "default_cover_concurrency")]
    pub concurrency: usize,

    /// Attempts per record before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Base backoff between retries in ms (doubled per retry).
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,

    /// Also retry records left without a cover by earlier runs.
    #[serde(default = "default_true")]
    pub backfill: bool,
}

impl Default for CoversConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_bilibili_base_url(),
            timeout_ms: default_cover_timeout(),
            concurrency: default_cover_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
            backfill: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_bilibili_base_url() -> String {
    "https://api.bilibili.com".into()
}
fn default_cover_timeout() -> u64 {
    2_000
}
fn default_cover_concurrency() -> usize {
    5
}
fn default_max_attempts() -> u8 {
    MAX_COVER_ATTEMPTS
}
fn default_backoff() -> u64 {
    200
}

/// `[sync]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Global time budget for one run, in seconds.
    #[serde(default = "default_time_budget")]
    pub time_budget_secs: u64,

    /// `last_edited_at` drift treated as noise, in seconds.
    #[serde(default = "default_edit_tolerance")]
    pub edit_tolerance_secs: u64,

    /// How long finished runs stay visible to pollers, in seconds.
    #[serde(default = "default_run_retention")]
    pub run_retention_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            time_budget_secs: default_time_budget(),
            edit_tolerance_secs: default_edit_tolerance(),
            run_retention_secs: default_run_retention(),
        }
    }
}

fn default_time_budget() -> u64 {
    50
}
fn default_edit_tolerance() -> u64 {
    3_600
}
fn default_run_retention() -> u64 {
    3_600
}

/// Which durable store backs the baseline, in front of the local file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Supabase,
    Sqlite,
    None,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Local JSON baseline (always written, read when the backend fails).
    #[serde(default = "default_local_path")]
    pub local_path: String,

    /// Database file for the `sqlite` backend.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            local_path: default_local_path(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_local_path() -> String {
    "~/.catalogsync/baseline.json".into()
}
fn default_sqlite_path() -> String {
    "~/.catalogsync/catalogsync.db".into()
}

/// `[supabase]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    #[serde(default = "default_supabase_url_env")]
    pub url_env: String,

    #[serde(default = "default_supabase_key_env")]
    pub key_env: String,

    #[serde(default = "default_table")]
    pub table: String,

    /// Rows per upsert request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url_env: default_supabase_url_env(),
            key_env: default_supabase_key_env(),
            table: default_table(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_supabase_url_env() -> String {
    "SUPABASE_URL".into()
}
fn default_supabase_key_env() -> String {
    "SUPABASE_ANON_KEY".into()
}
fn default_table() -> String {
    "songs".into()
}
fn default_batch_size() -> usize {
    500
}

// ---------------------------------------------------------------------------
// Resolved runtime settings (config file + env vars + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime Notion settings with the token and database ids resolved.
#[derive(Debug, Clone)]
pub struct NotionSettings {
    pub api_key: String,
    pub database_ids: Vec<String>,
    pub base_url: Url,
    pub notion_version: String,
    pub page_size: u32,
    pub page_delay: Duration,
    pub max_pages: Option<u32>,
    pub fields: FieldNames,
}

/// Runtime cover lookup settings.
#[derive(Debug, Clone)]
pub struct CoverSettings {
    pub enabled: bool,
    pub base_url: Url,
    pub timeout: Duration,
    pub concurrency: usize,
    pub max_attempts: u8,
    pub backoff: Duration,
    pub backfill: bool,
}

impl CoverSettings {
    /// Validate the `[covers]` section.
    pub fn from_config(config: &CoversConfig) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(CatalogSyncError::config("covers.concurrency must be at least 1"));
        }
        if config.max_attempts == 0 || config.max_attempts > MAX_COVER_ATTEMPTS {
            return Err(CatalogSyncError::config(format!(
                "covers.max_attempts must be between 1 and {MAX_COVER_ATTEMPTS}"
            )));
        }
        Ok(Self {
            enabled: config.enabled,
            base_url: parse_url("covers.base_url", &config.base_url)?,
            timeout: Duration::from_millis(config.timeout_ms),
            concurrency: config.concurrency,
            max_attempts: config.max_attempts,
            backoff: Duration::from_millis(config.backoff_ms),
            backfill: config.backfill,
        })
    }
}

/// Runtime Supabase settings with URL and key resolved.
#[derive(Debug, Clone)]
pub struct SupabaseSettings {
    pub url: Url,
    pub api_key: String,
    pub table: String,
    pub batch_size: usize,
}

impl SupabaseSettings {
    /// Resolve the `[supabase]` section against the environment.
    pub fn resolve(config: &SupabaseConfig) -> Result<Self> {
        let url = require_env(&config.url_env)?;
        let api_key = require_env(&config.key_env)?;
        Ok(Self {
            url: parse_url(&config.url_env, &url)?,
            api_key,
            table: config.table.clone(),
            batch_size: config.batch_size.max(1),
        })
    }
}

/// Everything one sync run needs, validated up front.
///
/// Building this is the only place configuration errors surface; once it
/// exists no further config lookups happen during the run.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub notion: NotionSettings,
    pub covers: CoverSettings,
    pub time_budget: Duration,
    pub edit_tolerance: Duration,
    pub run_retention: Duration,
}

impl SyncSettings {
    /// Resolve the config against the environment.
    pub fn resolve(config: &AppConfig) -> Result<Self> {
        let api_key = require_env(&config.notion.api_key_env)?;

        let database_ids = if config.notion.database_ids.is_empty() {
            let raw = require_env(&config.notion.database_ids_env)?;
            split_ids(&raw)
        } else {
            config.notion.database_ids.clone()
        };
        if database_ids.is_empty() {
            return Err(CatalogSyncError::config(format!(
                "no Notion database ids configured. Set notion.database_ids or the {} environment variable.",
                config.notion.database_ids_env
            )));
        }

        let notion = NotionSettings {
            api_key,
            database_ids,
            base_url: parse_url("notion.base_url", &config.notion.base_url)?,
            notion_version: config.notion.notion_version.clone(),
            page_size: config.notion.page_size.clamp(1, 100),
            page_delay: Duration::from_millis(config.notion.page_delay_ms),
            max_pages: (config.notion.max_pages > 0).then_some(config.notion.max_pages),
            fields: config.notion.fields.clone(),
        };

        Ok(Self {
            notion,
            covers: CoverSettings::from_config(&config.covers)?,
            time_budget: Duration::from_secs(config.sync.time_budget_secs),
            edit_tolerance: Duration::from_secs(config.sync.edit_tolerance_secs),
            run_retention: Duration::from_secs(config.sync.run_retention_secs),
        })
    }
}

/// Read a required, non-empty environment variable.
fn require_env(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(CatalogSyncError::config(format!(
            "{var_name} is not set. Export it or point the config at another variable."
        ))),
    }
}

fn split_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_url(what: &str, raw: &str) -> Result<Url> {
    // Keep a trailing slash so `Url::join` appends instead of replacing.
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized)
        .map_err(|e| CatalogSyncError::config(format!("invalid URL in {what}: {e}")))
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.catalogsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CatalogSyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.catalogsync/catalogsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CatalogSyncError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        CatalogSyncError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CatalogSyncError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CatalogSyncError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CatalogSyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("NOTION_API_KEY"));
        assert!(toml_str.contains("SUPABASE_ANON_KEY"));
        assert!(toml_str.contains("作品名称"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.covers.concurrency, 5);
        assert_eq!(parsed.covers.max_attempts, 3);
        assert_eq!(parsed.sync.edit_tolerance_secs, 3_600);
        assert_eq!(parsed.cache.backend, CacheBackend::Supabase);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[notion]
database_ids = ["db-one", "db-two"]

[notion.fields]
title = "Name"

[cache]
backend = "sqlite"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.notion.database_ids.len(), 2);
        assert_eq!(config.notion.fields.title, "Name");
        assert_eq!(config.notion.fields.creator, "全民制作人");
        assert_eq!(config.cache.backend, CacheBackend::Sqlite);
        assert_eq!(config.notion.page_size, 100);
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.notion.api_key_env = "CS_TEST_NONEXISTENT_KEY_12345".into();
        config.notion.database_ids = vec!["db".into()];
        let err = SyncSettings::resolve(&config).unwrap_err();
        assert!(matches!(err, CatalogSyncError::Config { .. }));
        assert!(err.to_string().contains("CS_TEST_NONEXISTENT_KEY_12345"));
    }

    #[test]
    fn cover_settings_reject_zero_concurrency() {
        let config = CoversConfig {
            concurrency: 0,
            ..CoversConfig::default()
        };
        assert!(CoverSettings::from_config(&config).is_err());
    }

    #[test]
    fn cover_settings_defaults() {
        let settings = CoverSettings::from_config(&CoversConfig::default()).expect("defaults");
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.timeout, Duration::from_secs(2));
        assert_eq!(settings.base_url.as_str(), "https://api.bilibili.com/");
    }

    #[test]
    fn split_ids_trims_and_drops_empty() {
        assert_eq!(split_ids(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_ids(" , ").is_empty());
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/tmp/x.json"), PathBuf::from("/tmp/x.json"));
    }
}
