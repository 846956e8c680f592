//! Snapshot ingestion.
//!
//! Turns a captured HTML file plus its metadata into a Version, registering
//! the Page on first sight of its url. The file is read and hashed before
//! anything is written, so a bad capture never leaves a record behind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use web_monitoring_core::models::{sha256_hex, NewPage, NewVersion};
use web_monitoring_core::store::Store;
use web_monitoring_core::Error;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// A capture deposited on disk, with the metadata needed to file it.
#[derive(Debug, Clone)]
pub struct CaptureInput {
    pub path: PathBuf,
    pub url: String,
    pub title: String,
    pub agency: String,
    pub site: String,
    pub capture_time: DateTime<Utc>,
    pub source_type: String,
    pub source_metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub page_uuid: Uuid,
    pub version_uuid: Uuid,
    pub page_created: bool,
    pub version_hash: String,
}

/// Read a capture file. Empty, unreadable, and non-UTF-8 files are
/// rejected.
fn read_capture(path: &Path) -> web_monitoring_core::Result<Vec<u8>> {
    let fail = |reason: String| Error::CaptureRead {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = std::fs::read(path).map_err(|e| fail(e.to_string()))?;
    if bytes.is_empty() {
        return Err(fail("file is empty".into()));
    }
    if let Err(e) = std::str::from_utf8(&bytes) {
        return Err(fail(format!("not valid UTF-8: {}", e)));
    }
    Ok(bytes)
}

/// Find the Page for `input.url`, creating it if unseen.
async fn resolve_page(store: &dyn Store, input: &CaptureInput) -> web_monitoring_core::Result<(Uuid, bool)> {
    if let Some(page) = store.page_by_url(&input.url).await? {
        return Ok((page.uuid, false));
    }

    let new_page = NewPage {
        uuid: None,
        url: input.url.clone(),
        title: input.title.clone(),
        agency: input.agency.clone(),
        site: input.site.clone(),
    };
    match store.insert_page(&new_page).await {
        Ok(id) => Ok((id, true)),
        // Another ingester registered the url first.
        Err(Error::DuplicateKey { kind: "page url", .. }) => {
            let page = store
                .page_by_url(&input.url)
                .await?
                .ok_or_else(|| Error::not_found("page", &input.url))?;
            Ok((page.uuid, false))
        }
        Err(e) => Err(e),
    }
}

/// Record one capture as a new Version.
pub async fn ingest_capture(
    store: &dyn Store,
    input: &CaptureInput,
) -> web_monitoring_core::Result<Ingested> {
    let bytes = read_capture(&input.path)?;
    let version_hash = sha256_hex(&bytes);
    let uri = std::fs::canonicalize(&input.path)
        .unwrap_or_else(|_| input.path.clone())
        .display()
        .to_string();

    let (page_uuid, page_created) = resolve_page(store, input).await?;

    let version_uuid = store
        .insert_version(&NewVersion {
            uuid: None,
            page_uuid,
            capture_time: input.capture_time,
            uri,
            version_hash: version_hash.clone(),
            source_type: input.source_type.clone(),
            source_metadata: input.source_metadata.clone(),
        })
        .await?;

    tracing::info!(
        page = %page_uuid,
        version = %version_uuid,
        url = %input.url,
        capture_time = %input.capture_time,
        "ingested capture"
    );

    Ok(Ingested {
        page_uuid,
        version_uuid,
        page_created,
        version_hash,
    })
}

/// Parse `--capture-time`: RFC 3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn parse_capture_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("Invalid capture time '{}'. Use RFC 3339.", raw))?;
    Ok(naive.and_utc())
}

/// CLI entry point for `wm ingest`.
pub async fn run_ingest(config: &Config, input: CaptureInput) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);

    let ingested = ingest_capture(&store, &input)
        .await
        .with_context(|| format!("Failed to ingest {}", input.path.display()))?;

    println!("ingest {}", input.url);
    println!(
        "  page: {}{}",
        ingested.page_uuid,
        if ingested.page_created { " (new)" } else { "" }
    );
    println!("  version: {}", ingested.version_uuid);
    println!("  version_hash: {}", ingested.version_hash);
    println!("ok");

    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use web_monitoring_core::store::InMemoryStore;

    fn input(path: PathBuf, minute: u32) -> CaptureInput {
        CaptureInput {
            path,
            url: "https://www.epa.gov/climatechange".into(),
            title: "Climate Change".into(),
            agency: "EPA".into(),
            site: "epa.gov".into(),
            capture_time: Utc.with_ymd_and_hms(2017, 1, 20, 12, minute, 0).unwrap(),
            source_type: "versionista".into(),
            source_metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn second_capture_reuses_page() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.html");
        let b = tmp.path().join("b.html");
        std::fs::write(&a, "<p>one</p>").unwrap();
        std::fs::write(&b, "<p>two</p>").unwrap();
        let store = InMemoryStore::new();

        let first = ingest_capture(&store, &input(a, 0)).await.unwrap();
        let second = ingest_capture(&store, &input(b, 5)).await.unwrap();

        assert!(first.page_created);
        assert!(!second.page_created);
        assert_eq!(first.page_uuid, second.page_uuid);
        assert_ne!(first.version_hash, second.version_hash);
        assert_eq!(first.version_hash, sha256_hex(b"<p>one</p>"));
        assert_eq!(store.page_versions(first.page_uuid).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bad_captures_create_nothing() {
        let tmp = TempDir::new().unwrap();
        let empty = tmp.path().join("empty.html");
        let binary = tmp.path().join("binary.html");
        std::fs::write(&empty, "").unwrap();
        std::fs::write(&binary, [0xff, 0xfe, 0x00, 0x81]).unwrap();
        let store = InMemoryStore::new();

        for path in [empty, binary, tmp.path().join("missing.html")] {
            let err = ingest_capture(&store, &input(path, 0)).await.unwrap_err();
            assert!(matches!(err, Error::CaptureRead { .. }));
        }
        assert_eq!(store.stats().await.unwrap().pages, 0);
        assert_eq!(store.stats().await.unwrap().versions, 0);
    }

    #[test]
    fn capture_time_formats() {
        let a = parse_capture_time("2017-01-20T12:00:00Z").unwrap();
        let b = parse_capture_time("2017-01-20 12:00:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_capture_time("yesterday").is_err());
    }
}
