//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`migrate`](crate::migrate). Multi-statement writes (`insert_version`,
//! `insert_diff`) run in a transaction so each record lands atomically.
//!
//! The unprocessed-version queue is read through `versions.pending`, a flag
//! covered by the partial index `idx_versions_pending`. Writes that can
//! change a Version's membership set or clear the flag inside their own
//! transaction; the full predicate is then only evaluated for flagged rows.
//!
//! Timestamps are stored as microseconds since the Unix epoch and uuids as
//! hyphenated lowercase text, whose lexicographic order matches `Uuid`'s
//! byte order. That keeps the (capture_time, uuid) ordering identical to
//! the in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use web_monitoring_core::models::{
    Annotation, DeadLetter, Diff, DiffInsert, NewAnnotation, NewDiff, NewPage, NewVersion, Page,
    Priority, StoreStats, Version, VersionOutcome,
};
use web_monitoring_core::store::Store;
use web_monitoring_core::{Error, Result};

const VERSION_COLUMNS: &str =
    "uuid, page_uuid, capture_time, uri, version_hash, source_type, source_metadata";

const DIFF_COLUMNS: &str =
    "uuid, version_from, version_to, diffhash, uri, source_type, source_metadata, priority";

/// Predicate selecting Versions whose Diff from their current predecessor
/// is missing and that carry no terminal outcome. Expects the outer query
/// to alias `versions` as `v` and LEFT JOIN `version_outcomes` as `o`.
pub(crate) const UNPROCESSED_VERSION_PREDICATE: &str = r#"
    (o.status IS NULL OR o.status = 'retry')
    AND NOT EXISTS (
        SELECT 1 FROM diffs d
        WHERE d.version_to = v.uuid
          AND d.version_from = (
              SELECT p.uuid FROM versions p
              WHERE p.page_uuid = v.page_uuid
                AND (p.capture_time < v.capture_time
                     OR (p.capture_time = v.capture_time AND p.uuid < v.uuid))
              ORDER BY p.capture_time DESC, p.uuid DESC
              LIMIT 1
          )
    )
"#;

/// Uuid of the Version immediately before `?` (a version uuid), bound once.
const PREDECESSOR_OF: &str = r#"
    SELECT p.uuid FROM versions p, versions t
    WHERE t.uuid = ?
      AND p.page_uuid = t.page_uuid
      AND (p.capture_time < t.capture_time
           OR (p.capture_time = t.capture_time AND p.uuid < t.uuid))
    ORDER BY p.capture_time DESC, p.uuid DESC
    LIMIT 1
"#;

/// Queue read, front first. `filter` narrows the rows the predicate runs on.
fn unprocessed_versions_sql(filter: &str) -> String {
    format!(
        r#"
        SELECT v.uuid FROM versions v
        LEFT JOIN version_outcomes o ON o.version_uuid = v.uuid
        WHERE {} AND {}
        ORDER BY COALESCE(o.attempts, 0) ASC, v.rowid ASC
        LIMIT ?
        "#,
        filter, UNPROCESSED_VERSION_PREDICATE
    )
}

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ensure_version(&self, version: Uuid) -> Result<()> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM versions WHERE uuid = ?")
            .bind(version.to_string())
            .fetch_one(&self.pool)
            .await
            .storage()?;
        if exists {
            Ok(())
        } else {
            Err(Error::not_found("version", version))
        }
    }
}

trait StorageResultExt<T> {
    fn storage(self) -> Result<T>;
}

impl<T> StorageResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn storage(self) -> Result<T> {
        self.map_err(Error::storage)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Storage(format!("timestamp out of range: {}", micros).into()))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(Error::storage)
}

fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::json!({}))
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn page_from_row(row: &SqliteRow) -> Result<Page> {
    Ok(Page {
        uuid: parse_uuid(row.get("uuid"))?,
        url: row.get("url"),
        title: row.get("title"),
        agency: row.get("agency"),
        site: row.get("site"),
    })
}

fn version_from_row(row: &SqliteRow) -> Result<Version> {
    let metadata: String = row.get("source_metadata");
    Ok(Version {
        uuid: parse_uuid(row.get("uuid"))?,
        page_uuid: parse_uuid(row.get("page_uuid"))?,
        capture_time: from_micros(row.get("capture_time"))?,
        uri: row.get("uri"),
        version_hash: row.get("version_hash"),
        source_type: row.get("source_type"),
        source_metadata: parse_json(&metadata),
    })
}

fn diff_from_row(row: &SqliteRow) -> Result<Diff> {
    let metadata: String = row.get("source_metadata");
    Ok(Diff {
        uuid: parse_uuid(row.get("uuid"))?,
        version_from: parse_uuid(row.get("version_from"))?,
        version_to: parse_uuid(row.get("version_to"))?,
        diffhash: row.get("diffhash"),
        uri: row.get("uri"),
        source_type: row.get("source_type"),
        source_metadata: parse_json(&metadata),
        priority: row.get("priority"),
        content: None,
    })
}

fn annotation_from_row(row: &SqliteRow) -> Result<Annotation> {
    let content: String = row.get("content");
    Ok(Annotation {
        uuid: parse_uuid(row.get("uuid"))?,
        diff_uuid: parse_uuid(row.get("diff_uuid"))?,
        author: row.get("author"),
        content: serde_json::from_str(&content).unwrap_or(serde_json::Value::String(content)),
        created_at: from_micros(row.get("created_at"))?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_page(&self, page: &NewPage) -> Result<Uuid> {
        let id = page.uuid.unwrap_or_else(Uuid::new_v4);
        let now = to_micros(Utc::now());

        let result = sqlx::query(
            r#"
            INSERT INTO pages (uuid, url, title, agency, site, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&page.url)
        .bind(&page.title)
        .bind(&page.agency)
        .bind(&page.site)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(e) if is_unique_violation(&e) => {
                let url_taken = self.page_by_url(&page.url).await?.is_some();
                Err(if url_taken {
                    Error::DuplicateKey {
                        kind: "page url",
                        id: page.url.clone(),
                    }
                } else {
                    Error::DuplicateKey {
                        kind: "page",
                        id: id.to_string(),
                    }
                })
            }
            Err(e) => Err(Error::storage(e)),
        }
    }

    async fn get_page(&self, id: Uuid) -> Result<Page> {
        let row = sqlx::query("SELECT uuid, url, title, agency, site FROM pages WHERE uuid = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .storage()?;
        match row {
            Some(row) => page_from_row(&row),
            None => Err(Error::not_found("page", id)),
        }
    }

    async fn page_by_url(&self, url: &str) -> Result<Option<Page>> {
        let row = sqlx::query("SELECT uuid, url, title, agency, site FROM pages WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .storage()?;
        row.as_ref().map(page_from_row).transpose()
    }

    async fn insert_version(&self, version: &NewVersion) -> Result<Uuid> {
        let id = version.uuid.unwrap_or_else(Uuid::new_v4);
        let page = version.page_uuid.to_string();
        let capture = to_micros(version.capture_time);

        let page_exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM pages WHERE uuid = ?")
            .bind(&page)
            .fetch_one(&self.pool)
            .await
            .storage()?;
        if !page_exists {
            return Err(Error::not_found("page", version.page_uuid));
        }

        // First statement in the transaction must be a write.
        let mut tx = self.pool.begin().await.storage()?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO versions (uuid, page_uuid, capture_time, uri, version_hash,
                                  source_type, source_metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&page)
        .bind(capture)
        .bind(&version.uri)
        .bind(&version.version_hash)
        .bind(&version.source_type)
        .bind(version.source_metadata.to_string())
        .bind(to_micros(Utc::now()))
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(Error::DuplicateKey {
                    kind: "version",
                    id: id.to_string(),
                })
            }
            Err(e) => return Err(Error::storage(e)),
        }

        // The next Version now diffs against this one, and any later Version
        // that was the oldest has an ancestor. Dead letters stay parked.
        sqlx::query(
            r#"
            UPDATE versions SET pending = 1
            WHERE (
                uuid IN (
                    SELECT uuid FROM versions
                    WHERE page_uuid = ?1
                      AND (capture_time > ?2 OR (capture_time = ?2 AND uuid > ?3))
                    ORDER BY capture_time ASC, uuid ASC
                    LIMIT 1
                )
                AND uuid NOT IN (
                    SELECT version_uuid FROM version_outcomes WHERE status = 'dead_letter'
                )
            )
            OR uuid IN (
                SELECT o.version_uuid FROM version_outcomes o
                JOIN versions l ON l.uuid = o.version_uuid
                WHERE o.status = 'no_ancestor'
                  AND l.page_uuid = ?1
                  AND (l.capture_time > ?2 OR (l.capture_time = ?2 AND l.uuid > ?3))
            )
            "#,
        )
        .bind(&page)
        .bind(capture)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .storage()?;

        sqlx::query(
            r#"
            DELETE FROM version_outcomes
            WHERE status = 'no_ancestor'
              AND version_uuid IN (
                  SELECT uuid FROM versions
                  WHERE page_uuid = ?
                    AND (capture_time > ? OR (capture_time = ? AND uuid > ?))
              )
            "#,
        )
        .bind(&page)
        .bind(capture)
        .bind(capture)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .storage()?;

        tx.commit().await.storage()?;
        Ok(id)
    }

    async fn get_version(&self, id: Uuid) -> Result<Version> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM versions WHERE uuid = ?",
            VERSION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .storage()?;
        match row {
            Some(row) => version_from_row(&row),
            None => Err(Error::not_found("version", id)),
        }
    }

    async fn page_versions(&self, page: Uuid) -> Result<Vec<Version>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM versions WHERE page_uuid = ? ORDER BY capture_time ASC, uuid ASC",
            VERSION_COLUMNS
        ))
        .bind(page.to_string())
        .fetch_all(&self.pool)
        .await
        .storage()?;
        rows.iter().map(version_from_row).collect()
    }

    async fn predecessor(&self, version: &Version) -> Result<Option<Version>> {
        let capture = to_micros(version.capture_time);
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM versions
            WHERE page_uuid = ?
              AND (capture_time < ? OR (capture_time = ? AND uuid < ?))
            ORDER BY capture_time DESC, uuid DESC
            LIMIT 1
            "#,
            VERSION_COLUMNS
        ))
        .bind(version.page_uuid.to_string())
        .bind(capture)
        .bind(capture)
        .bind(version.uuid.to_string())
        .fetch_optional(&self.pool)
        .await
        .storage()?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn insert_diff(&self, diff: &NewDiff) -> Result<DiffInsert> {
        let from = diff.version_from.to_string();
        let to = diff.version_to.to_string();

        let from_page: Option<String> =
            sqlx::query_scalar("SELECT page_uuid FROM versions WHERE uuid = ?")
                .bind(&from)
                .fetch_optional(&self.pool)
                .await
                .storage()?;
        let to_page: Option<String> =
            sqlx::query_scalar("SELECT page_uuid FROM versions WHERE uuid = ?")
                .bind(&to)
                .fetch_optional(&self.pool)
                .await
                .storage()?;
        match (from_page, to_page) {
            (None, _) => return Err(Error::not_found("version", diff.version_from)),
            (_, None) => return Err(Error::not_found("version", diff.version_to)),
            (Some(a), Some(b)) if a != b => {
                return Err(Error::PageMismatch {
                    from: diff.version_from,
                    to: diff.version_to,
                })
            }
            _ => {}
        }

        let existing: Option<String> =
            sqlx::query_scalar("SELECT uuid FROM diffs WHERE version_from = ? AND version_to = ?")
                .bind(&from)
                .bind(&to)
                .fetch_optional(&self.pool)
                .await
                .storage()?;
        if let Some(existing) = existing {
            return Ok(DiffInsert::Existing(parse_uuid(&existing)?));
        }

        let id = diff.uuid.unwrap_or_else(Uuid::new_v4);
        let now = to_micros(Utc::now());
        let mut tx = self.pool.begin().await.storage()?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO diffs (uuid, version_from, version_to, diffhash, uri, source_type,
                               source_metadata, priority, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&from)
        .bind(&to)
        .bind(&diff.diffhash)
        .bind(&diff.uri)
        .bind(&diff.source_type)
        .bind(diff.source_metadata.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                drop(tx);
                // A concurrent writer won the race for this pair.
                return match self.diff_for_pair(diff.version_from, diff.version_to).await? {
                    Some(winner) => Ok(DiffInsert::Existing(winner.uuid)),
                    None => Err(Error::DuplicateKey {
                        kind: "diff",
                        id: id.to_string(),
                    }),
                };
            }
            Err(e) => return Err(Error::storage(e)),
        }

        sqlx::query("DELETE FROM version_outcomes WHERE version_uuid = ?")
            .bind(&to)
            .execute(&mut *tx)
            .await
            .storage()?;

        // A Diff from a stale predecessor leaves the Version queued.
        sqlx::query(&format!(
            "UPDATE versions SET pending = 0 WHERE uuid = ? AND ({}) = ?",
            PREDECESSOR_OF
        ))
        .bind(&to)
        .bind(&to)
        .bind(&from)
        .execute(&mut *tx)
        .await
        .storage()?;

        tx.commit().await.storage()?;
        Ok(DiffInsert::Created(id))
    }

    async fn get_diff(&self, id: Uuid) -> Result<Diff> {
        let row = sqlx::query(&format!("SELECT {} FROM diffs WHERE uuid = ?", DIFF_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .storage()?;
        match row {
            Some(row) => diff_from_row(&row),
            None => Err(Error::not_found("diff", id)),
        }
    }

    async fn diff_for_pair(&self, from: Uuid, to: Uuid) -> Result<Option<Diff>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM diffs WHERE version_from = ? AND version_to = ?",
            DIFF_COLUMNS
        ))
        .bind(from.to_string())
        .bind(to.to_string())
        .fetch_optional(&self.pool)
        .await
        .storage()?;
        row.as_ref().map(diff_from_row).transpose()
    }

    async fn set_priority(&self, id: Uuid, priority: Priority) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE diffs SET priority = ?, updated_at = ? WHERE uuid = ? AND priority IS NULL",
        )
        .bind(priority)
        .bind(to_micros(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .storage()?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }
        // Either already prioritized or missing.
        self.get_diff(id).await.map(|_| false)
    }

    async fn insert_annotation(&self, annotation: &NewAnnotation) -> Result<Uuid> {
        let diff_exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM diffs WHERE uuid = ?")
            .bind(annotation.diff_uuid.to_string())
            .fetch_one(&self.pool)
            .await
            .storage()?;
        if !diff_exists {
            return Err(Error::not_found("diff", annotation.diff_uuid));
        }

        let id = annotation.uuid.unwrap_or_else(Uuid::new_v4);
        let inserted = sqlx::query(
            "INSERT INTO annotations (uuid, diff_uuid, author, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(annotation.diff_uuid.to_string())
        .bind(&annotation.author)
        .bind(annotation.content.to_string())
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(id),
            Err(e) if is_unique_violation(&e) => Err(Error::DuplicateKey {
                kind: "annotation",
                id: id.to_string(),
            }),
            Err(e) => Err(Error::storage(e)),
        }
    }

    async fn get_annotation(&self, id: Uuid) -> Result<Annotation> {
        let row = sqlx::query(
            "SELECT uuid, diff_uuid, author, content, created_at FROM annotations WHERE uuid = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .storage()?;
        match row {
            Some(row) => annotation_from_row(&row),
            None => Err(Error::not_found("annotation", id)),
        }
    }

    async fn annotations_for_diff(&self, diff: Uuid) -> Result<Vec<Annotation>> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, diff_uuid, author, content, created_at FROM annotations
            WHERE diff_uuid = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(diff.to_string())
        .fetch_all(&self.pool)
        .await
        .storage()?;
        rows.iter().map(annotation_from_row).collect()
    }

    async fn unprocessed_versions(&self, limit: usize) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(&unprocessed_versions_sql("v.pending = 1"))
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .storage()?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    async fn unprocessed_diffs(&self, limit: usize) -> Result<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT uuid FROM diffs WHERE priority IS NULL ORDER BY created_at ASC, rowid ASC LIMIT ?",
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .storage()?;
        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    async fn record_outcome(&self, version: Uuid, outcome: &VersionOutcome) -> Result<u32> {
        if *outcome == VersionOutcome::NoAncestor {
            self.record_no_ancestor(version).await?;
            return self.version_attempts(version).await;
        }
        self.ensure_version(version).await?;

        let mut tx = self.pool.begin().await.storage()?;
        let attempts: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO version_outcomes (version_uuid, status, reason, attempts, updated_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(version_uuid) DO UPDATE SET
                status = excluded.status,
                reason = excluded.reason,
                attempts = version_outcomes.attempts + 1,
                updated_at = excluded.updated_at
            RETURNING attempts
            "#,
        )
        .bind(version.to_string())
        .bind(outcome.status())
        .bind(outcome.reason())
        .bind(to_micros(Utc::now()))
        .fetch_one(&mut *tx)
        .await
        .storage()?;

        if matches!(outcome, VersionOutcome::DeadLetter { .. }) {
            sqlx::query("UPDATE versions SET pending = 0 WHERE uuid = ?")
                .bind(version.to_string())
                .execute(&mut *tx)
                .await
                .storage()?;
        }
        tx.commit().await.storage()?;

        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    async fn record_no_ancestor(&self, version: Uuid) -> Result<bool> {
        self.ensure_version(version).await?;
        let id = version.to_string();

        let mut tx = self.pool.begin().await.storage()?;
        // Checked and written under the same write lock as insert_version.
        let recorded = sqlx::query(&format!(
            r#"
            INSERT INTO version_outcomes (version_uuid, status, reason, attempts, updated_at)
            SELECT ?, 'no_ancestor', ?, 0, ?
            WHERE NOT EXISTS ({})
            ON CONFLICT(version_uuid) DO UPDATE SET
                status = excluded.status,
                reason = excluded.reason,
                updated_at = excluded.updated_at
            "#,
            PREDECESSOR_OF
        ))
        .bind(&id)
        .bind(VersionOutcome::NoAncestor.reason())
        .bind(to_micros(Utc::now()))
        .bind(&id)
        .execute(&mut *tx)
        .await
        .storage()?
        .rows_affected()
            > 0;

        if recorded {
            sqlx::query("UPDATE versions SET pending = 0 WHERE uuid = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await
                .storage()?;
        }
        tx.commit().await.storage()?;
        Ok(recorded)
    }

    async fn version_attempts(&self, version: Uuid) -> Result<u32> {
        let row: Option<(Option<i64>,)> = sqlx::query_as(
            r#"
            SELECT o.attempts FROM versions v
            LEFT JOIN version_outcomes o ON o.version_uuid = v.uuid
            WHERE v.uuid = ?
            "#,
        )
        .bind(version.to_string())
        .fetch_optional(&self.pool)
        .await
        .storage()?;
        match row {
            Some((attempts,)) => Ok(u32::try_from(attempts.unwrap_or(0)).unwrap_or(u32::MAX)),
            None => Err(Error::not_found("version", version)),
        }
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT version_uuid, reason, attempts, updated_at FROM version_outcomes
            WHERE status = 'dead_letter'
            ORDER BY updated_at ASC, version_uuid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .storage()?;

        rows.iter()
            .map(|row| {
                let attempts: i64 = row.get("attempts");
                Ok(DeadLetter {
                    version_uuid: parse_uuid(row.get("version_uuid"))?,
                    reason: row.get("reason"),
                    attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
                    updated_at: from_micros(row.get("updated_at"))?,
                })
            })
            .collect()
    }

    async fn requeue_dead_letters(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.storage()?;
        sqlx::query(
            r#"
            UPDATE versions SET pending = 1
            WHERE uuid IN (SELECT version_uuid FROM version_outcomes WHERE status = 'dead_letter')
            "#,
        )
        .execute(&mut *tx)
        .await
        .storage()?;
        let result = sqlx::query("DELETE FROM version_outcomes WHERE status = 'dead_letter'")
            .execute(&mut *tx)
            .await
            .storage()?;
        tx.commit().await.storage()?;
        Ok(result.rows_affected())
    }

    async fn ranked_diffs(&self, limit: usize) -> Result<Vec<Diff>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM diffs
            WHERE priority IS NOT NULL
            ORDER BY priority DESC, created_at ASC, rowid ASC
            LIMIT ?
            "#,
            DIFF_COLUMNS
        ))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .storage()?;
        rows.iter().map(diff_from_row).collect()
    }

    async fn stats(&self) -> Result<StoreStats> {
        async fn count(pool: &SqlitePool, sql: &str) -> Result<u64> {
            let n: i64 = sqlx::query_scalar(sql).fetch_one(pool).await.storage()?;
            Ok(n.max(0) as u64)
        }

        let unprocessed_versions_sql = format!(
            r#"
            SELECT COUNT(*) FROM versions v
            LEFT JOIN version_outcomes o ON o.version_uuid = v.uuid
            WHERE v.pending = 1 AND {}
            "#,
            UNPROCESSED_VERSION_PREDICATE
        );

        Ok(StoreStats {
            pages: count(&self.pool, "SELECT COUNT(*) FROM pages").await?,
            versions: count(&self.pool, "SELECT COUNT(*) FROM versions").await?,
            diffs: count(&self.pool, "SELECT COUNT(*) FROM diffs").await?,
            annotations: count(&self.pool, "SELECT COUNT(*) FROM annotations").await?,
            unprocessed_versions: count(&self.pool, &unprocessed_versions_sql).await?,
            unprocessed_diffs: count(
                &self.pool,
                "SELECT COUNT(*) FROM diffs WHERE priority IS NULL",
            )
            .await?,
            no_ancestor: count(
                &self.pool,
                "SELECT COUNT(*) FROM version_outcomes WHERE status = 'no_ancestor'",
            )
            .await?,
            dead_letters: count(
                &self.pool,
                "SELECT COUNT(*) FROM version_outcomes WHERE status = 'dead_letter'",
            )
            .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("wm.sqlite"))
            .await
            .unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    async fn page(store: &SqliteStore, url: &str) -> Uuid {
        store
            .insert_page(&NewPage {
                url: url.to_string(),
                title: "Title".into(),
                agency: "NOAA".into(),
                site: "noaa.gov".into(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn version(store: &SqliteStore, page: Uuid, minute: u32) -> Uuid {
        store
            .insert_version(&NewVersion {
                uuid: None,
                page_uuid: page,
                capture_time: Utc.with_ymd_and_hms(2017, 3, 1, 0, minute, 0).unwrap(),
                uri: format!("/captures/{}.html", minute),
                version_hash: format!("h{}", minute),
                source_type: "test".into(),
                source_metadata: serde_json::json!({"minute": minute}),
            })
            .await
            .unwrap()
    }

    fn new_diff(from: Uuid, to: Uuid) -> NewDiff {
        NewDiff {
            uuid: None,
            version_from: from,
            version_to: to,
            diffhash: "abcdef0123".into(),
            uri: "/diffs/ab/abcdef0123.json".into(),
            source_type: "test".into(),
            source_metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn pages_round_trip_and_reject_duplicate_urls() {
        let (_tmp, store) = open().await;
        let id = page(&store, "https://www.noaa.gov/").await;
        let fetched = store.get_page(id).await.unwrap();
        assert_eq!(fetched.agency, "NOAA");
        assert_eq!(
            store
                .page_by_url("https://www.noaa.gov/")
                .await
                .unwrap()
                .unwrap()
                .uuid,
            id
        );
        let dup = store
            .insert_page(&NewPage {
                url: "https://www.noaa.gov/".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(
            dup,
            Err(Error::DuplicateKey {
                kind: "page url",
                ..
            })
        ));
        assert!(store.get_page(Uuid::new_v4()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn version_requires_existing_page() {
        let (_tmp, store) = open().await;
        let err = store
            .insert_version(&NewVersion {
                uuid: None,
                page_uuid: Uuid::new_v4(),
                capture_time: Utc::now(),
                uri: "x".into(),
                version_hash: "y".into(),
                source_type: "test".into(),
                source_metadata: serde_json::json!({}),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn predecessor_and_queue_follow_capture_order() {
        let (_tmp, store) = open().await;
        let p = page(&store, "https://www.noaa.gov/climate").await;
        let c = version(&store, p, 30).await;
        let a = version(&store, p, 10).await;
        let b = version(&store, p, 20).await;

        let c_v = store.get_version(c).await.unwrap();
        assert_eq!(store.predecessor(&c_v).await.unwrap().unwrap().uuid, b);
        assert_eq!(c_v.source_metadata["minute"], 30);

        assert_eq!(
            store.unprocessed_versions(10).await.unwrap(),
            vec![c, a, b]
        );
        store
            .record_outcome(a, &VersionOutcome::NoAncestor)
            .await
            .unwrap();
        store.insert_diff(&new_diff(a, b)).await.unwrap();
        assert_eq!(store.unprocessed_versions(10).await.unwrap(), vec![c]);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.versions, 3);
        assert_eq!(stats.unprocessed_versions, 1);
        assert_eq!(stats.no_ancestor, 1);
    }

    #[tokio::test]
    async fn backfill_reopens_successor() {
        let (_tmp, store) = open().await;
        let p = page(&store, "https://www.noaa.gov/backfill").await;
        let a = version(&store, p, 10).await;
        store
            .record_outcome(a, &VersionOutcome::NoAncestor)
            .await
            .unwrap();
        assert!(store.unprocessed_versions(10).await.unwrap().is_empty());

        let older = version(&store, p, 5).await;
        assert_eq!(
            store.unprocessed_versions(10).await.unwrap(),
            vec![a, older]
        );
    }

    #[tokio::test]
    async fn diffs_are_unique_per_pair_and_prioritized_once() {
        let (_tmp, store) = open().await;
        let p = page(&store, "https://www.noaa.gov/diffs").await;
        let a = version(&store, p, 1).await;
        let b = version(&store, p, 2).await;

        let first = store.insert_diff(&new_diff(a, b)).await.unwrap();
        let again = store.insert_diff(&new_diff(a, b)).await.unwrap();
        assert!(first.is_created());
        assert_eq!(again, DiffInsert::Existing(first.uuid()));

        assert_eq!(
            store.unprocessed_diffs(10).await.unwrap(),
            vec![first.uuid()]
        );
        assert!(store.set_priority(first.uuid(), 0.0).await.unwrap());
        assert!(!store.set_priority(first.uuid(), 1.0).await.unwrap());
        assert_eq!(
            store.get_diff(first.uuid()).await.unwrap().priority,
            Some(0.0)
        );
        assert!(store.unprocessed_diffs(10).await.unwrap().is_empty());
        assert!(store
            .set_priority(Uuid::new_v4(), 1.0)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn annotations_append_and_outcomes_count_attempts() {
        let (_tmp, store) = open().await;
        let p = page(&store, "https://www.noaa.gov/notes").await;
        let a = version(&store, p, 1).await;
        let b = version(&store, p, 2).await;
        let diff = store.insert_diff(&new_diff(a, b)).await.unwrap().uuid();

        for n in 0..3 {
            store
                .insert_annotation(&NewAnnotation {
                    uuid: None,
                    diff_uuid: diff,
                    author: format!("reviewer-{}", n),
                    content: serde_json::json!({"significant": n % 2 == 0}),
                })
                .await
                .unwrap();
        }
        let notes = store.annotations_for_diff(diff).await.unwrap();
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].author, "reviewer-0");
        assert_eq!(store.annotations_for_change(a, b).await.unwrap().len(), 3);

        let retry = VersionOutcome::Retry {
            reason: "timeout".into(),
        };
        assert_eq!(store.record_outcome(a, &retry).await.unwrap(), 1);
        assert_eq!(store.record_outcome(a, &retry).await.unwrap(), 2);
        assert_eq!(store.version_attempts(a).await.unwrap(), 2);
        assert_eq!(store.version_attempts(b).await.unwrap(), 0);
        let dead = VersionOutcome::DeadLetter {
            reason: "timeout".into(),
        };
        assert_eq!(store.record_outcome(a, &dead).await.unwrap(), 3);
        assert_eq!(store.dead_letters().await.unwrap().len(), 1);
        assert_eq!(store.requeue_dead_letters().await.unwrap(), 1);
        assert!(store.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_ancestor_is_refused_once_an_older_capture_lands() {
        let (_tmp, store) = open().await;
        let p = page(&store, "https://www.noaa.gov/race").await;
        let later = version(&store, p, 10).await;
        let later_v = store.get_version(later).await.unwrap();
        assert!(store.predecessor(&later_v).await.unwrap().is_none());

        // Older capture ingested between the lookup and the write.
        let earlier = version(&store, p, 9).await;
        assert!(!store.record_no_ancestor(later).await.unwrap());
        store
            .record_outcome(later, &VersionOutcome::NoAncestor)
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap().no_ancestor, 0);
        assert_eq!(
            store.unprocessed_versions(10).await.unwrap(),
            vec![later, earlier]
        );

        assert!(store.record_no_ancestor(earlier).await.unwrap());
        assert_eq!(store.unprocessed_versions(10).await.unwrap(), vec![later]);
        assert!(store
            .record_no_ancestor(Uuid::new_v4())
            .await
            .unwrap_err()
            .is_not_found());
    }

    /// Queue membership evaluated over every row, ignoring `pending`.
    async fn full_scan(store: &SqliteStore) -> Vec<Uuid> {
        let ids: Vec<String> = sqlx::query_scalar(&unprocessed_versions_sql("1 = 1"))
            .bind(i64::MAX)
            .fetch_all(store.pool())
            .await
            .unwrap();
        ids.iter().map(|id| parse_uuid(id).unwrap()).collect()
    }

    async fn assert_index_agrees(store: &SqliteStore) {
        let indexed = store.unprocessed_versions(usize::MAX).await.unwrap();
        assert_eq!(indexed, full_scan(store).await);
        assert_eq!(
            store.stats().await.unwrap().unprocessed_versions,
            indexed.len() as u64
        );
    }

    #[tokio::test]
    async fn pending_flags_follow_every_write() {
        let (_tmp, store) = open().await;
        let p = page(&store, "https://www.noaa.gov/index").await;

        let c = version(&store, p, 3).await;
        let a = version(&store, p, 1).await;
        assert_index_agrees(&store).await;
        store.record_no_ancestor(a).await.unwrap();
        store.insert_diff(&new_diff(a, c)).await.unwrap();
        assert_index_agrees(&store).await;

        // Middle insert re-opens c against b.
        let b = version(&store, p, 2).await;
        assert_index_agrees(&store).await;
        let retry = VersionOutcome::Retry {
            reason: "timeout".into(),
        };
        store.record_outcome(b, &retry).await.unwrap();
        assert_index_agrees(&store).await;
        store
            .record_outcome(
                c,
                &VersionOutcome::DeadLetter {
                    reason: "timeout".into(),
                },
            )
            .await
            .unwrap();
        assert_index_agrees(&store).await;

        // Backfill while the former oldest is skipped and c is dead.
        let z = version(&store, p, 0).await;
        assert_index_agrees(&store).await;
        store.requeue_dead_letters().await.unwrap();
        assert_index_agrees(&store).await;
        store.insert_diff(&new_diff(a, b)).await.unwrap();
        store.insert_diff(&new_diff(b, c)).await.unwrap();
        store.insert_diff(&new_diff(z, a)).await.unwrap();
        assert_index_agrees(&store).await;
        assert_eq!(store.unprocessed_versions(10).await.unwrap(), vec![z]);

        let flagged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM versions WHERE pending = 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(flagged, 1);
    }

    #[tokio::test]
    async fn queue_read_goes_through_pending_index() {
        let (_tmp, store) = open().await;
        let rows = sqlx::query(&format!(
            "EXPLAIN QUERY PLAN {}",
            unprocessed_versions_sql("v.pending = 1")
        ))
        .bind(10_i64)
        .fetch_all(store.pool())
        .await
        .unwrap();
        let plan: Vec<String> = rows.iter().map(|r| r.get::<String, _>("detail")).collect();
        assert!(
            plan.iter().any(|d| d.contains("idx_versions_pending")),
            "plan: {:?}",
            plan
        );
    }

    #[tokio::test]
    async fn page_timestamps_are_microseconds() {
        let (_tmp, store) = open().await;
        let before = to_micros(Utc::now());
        let id = page(&store, "https://www.noaa.gov/clock").await;
        let after = to_micros(Utc::now());

        let (created, updated): (i64, i64) =
            sqlx::query_as("SELECT created_at, updated_at FROM pages WHERE uuid = ?")
                .bind(id.to_string())
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert!((before..=after).contains(&created), "created_at: {}", created);
        assert_eq!(created, updated);
    }
}
