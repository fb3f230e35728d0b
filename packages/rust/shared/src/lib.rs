//! Shared types, error model, and configuration for catalogsync.
//!
//! This crate is the foundation depended on by all other catalogsync crates.
//! It provides:
//! - [`CatalogSyncError`] — the unified error type
//! - Domain types ([`CatalogRecord`], [`RecordId`], [`SyncBaseline`])
//! - Configuration ([`AppConfig`], resolved runtime settings, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheBackend, CacheConfig, CoverSettings, CoversConfig, FieldNames, NotionConfig,
    NotionSettings, SupabaseConfig, SupabaseSettings, SyncConfig, SyncSettings, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from,
};
pub use error::{CatalogSyncError, Result};
pub use types::{
    CatalogRecord, MAX_COVER_ATTEMPTS, RecordId, SyncBaseline, extract_source_ref, stable_hash,
};
