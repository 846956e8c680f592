//! Database schema.
//!
//! | Table | Holds |
//! |-------|-------|
//! | `pages` | tracked URLs |
//! | `versions` | captures; `pending` marks queue candidates |
//! | `diffs` | one row per (version_from, version_to) pair |
//! | `annotations` | append-only reviewer notes on a diff |
//! | `version_outcomes` | `no_ancestor`, `retry` and `dead_letter` bookkeeping |
//!
//! All timestamps are INTEGER microseconds since the Unix epoch. Every
//! statement is idempotent, so `wm init` can run against an existing file.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::UNPROCESSED_VERSION_PREDICATE;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pages (
        uuid TEXT PRIMARY KEY,
        url TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        agency TEXT NOT NULL,
        site TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS versions (
        uuid TEXT PRIMARY KEY,
        page_uuid TEXT NOT NULL,
        capture_time INTEGER NOT NULL,
        uri TEXT NOT NULL,
        version_hash TEXT NOT NULL,
        source_type TEXT NOT NULL,
        source_metadata TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        pending INTEGER NOT NULL DEFAULT 1,
        FOREIGN KEY (page_uuid) REFERENCES pages(uuid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS diffs (
        uuid TEXT PRIMARY KEY,
        version_from TEXT NOT NULL,
        version_to TEXT NOT NULL,
        diffhash TEXT NOT NULL,
        uri TEXT NOT NULL,
        source_type TEXT NOT NULL,
        source_metadata TEXT NOT NULL DEFAULT '{}',
        priority REAL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(version_from, version_to),
        FOREIGN KEY (version_from) REFERENCES versions(uuid),
        FOREIGN KEY (version_to) REFERENCES versions(uuid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS annotations (
        uuid TEXT PRIMARY KEY,
        diff_uuid TEXT NOT NULL,
        author TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (diff_uuid) REFERENCES diffs(uuid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS version_outcomes (
        version_uuid TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        reason TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        FOREIGN KEY (version_uuid) REFERENCES versions(uuid)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_versions_page_order ON versions(page_uuid, capture_time, uuid)",
    "CREATE INDEX IF NOT EXISTS idx_versions_pending ON versions(pending) WHERE pending = 1",
    "CREATE INDEX IF NOT EXISTS idx_diffs_version_to ON diffs(version_to, version_from)",
    "CREATE INDEX IF NOT EXISTS idx_diffs_unprioritized ON diffs(created_at) WHERE priority IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_diffs_priority ON diffs(priority DESC) WHERE priority IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_annotations_diff ON annotations(diff_uuid, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_version_outcomes_status ON version_outcomes(status)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in TABLES {
        sqlx::query(statement).execute(pool).await?;
    }
    add_pending_column(pool).await?;
    for statement in INDEXES {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Databases created before the queue index existed lack `versions.pending`.
/// Add it and mark exactly the Versions that are currently unprocessed.
async fn add_pending_column(pool: &SqlitePool) -> Result<()> {
    let present: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('versions') WHERE name = 'pending'",
    )
    .fetch_one(pool)
    .await?;
    if present {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    sqlx::query("ALTER TABLE versions ADD COLUMN pending INTEGER NOT NULL DEFAULT 1")
        .execute(&mut *tx)
        .await?;
    let cleared = sqlx::query(&format!(
        r#"
        UPDATE versions SET pending = 0
        WHERE uuid NOT IN (
            SELECT v.uuid FROM versions v
            LEFT JOIN version_outcomes o ON o.version_uuid = v.uuid
            WHERE {}
        )
        "#,
        UNPROCESSED_VERSION_PREDICATE
    ))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(
        settled = cleared.rows_affected(),
        "added pending column to versions"
    );
    Ok(())
}
