//! SQL migration definitions for the local baseline database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: records, sync_state",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per catalog record, keyed by its RecordId rendering
CREATE TABLE IF NOT EXISTS records (
    record_key  TEXT PRIMARY KEY,
    position    INTEGER NOT NULL,
    source_ref  TEXT,
    title       TEXT NOT NULL,
    record_json TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_source_ref ON records(source_ref);

-- Key/value run metadata (last_sync, ...)
CREATE TABLE IF NOT EXISTS sync_state (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Cover columns for stats queries",
            sql: r#"
ALTER TABLE records ADD COLUMN cover_url TEXT;
ALTER TABLE records ADD COLUMN cover_fetch_attempts INTEGER NOT NULL DEFAULT 0;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
