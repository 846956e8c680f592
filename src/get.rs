//! Record retrieval for the CLI.
//!
//! `wm get page|version|diff` and `wm history` print one record (or a
//! Page's Versions) in a fixed-width `key: value` layout. Pages may be
//! addressed by uuid or by url.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use web_monitoring_core::models::{Diff, Page, Version};
use web_monitoring_core::store::Store;
use web_monitoring_core::Error;

use crate::config::Config;
use crate::db;
use crate::payload::PayloadStore;
use crate::sqlite_store::SqliteStore;

/// Look a Page up by uuid, falling back to url.
pub async fn resolve_page(store: &dyn Store, key: &str) -> web_monitoring_core::Result<Page> {
    if let Ok(id) = Uuid::parse_str(key) {
        return store.get_page(id).await;
    }
    store
        .page_by_url(key)
        .await?
        .ok_or_else(|| Error::not_found("page", key))
}

pub fn parse_uuid(kind: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid {} uuid: {}", kind, raw))
}

async fn open(config: &Config) -> Result<SqliteStore> {
    Ok(SqliteStore::new(db::connect(config).await?))
}

pub async fn run_get_page(config: &Config, key: &str) -> Result<()> {
    let store = open(config).await?;
    let page = resolve_page(&store, key).await?;
    let versions = store.page_versions(page.uuid).await?;

    println!("--- Page ---");
    print_page(&page);
    println!("versions:     {}", versions.len());
    if let (Some(first), Some(last)) = (versions.first(), versions.last()) {
        println!("first:        {}", format_ts(first.capture_time));
        println!("latest:       {}", format_ts(last.capture_time));
    }

    store.close().await;
    Ok(())
}

pub async fn run_get_version(config: &Config, id: &str) -> Result<()> {
    let store = open(config).await?;
    let version = store.get_version(parse_uuid("version", id)?).await?;
    let predecessor = store.predecessor(&version).await?;

    println!("--- Version ---");
    print_version(&version);
    match predecessor {
        Some(prev) => {
            println!("predecessor:  {}", prev.uuid);
            match store.diff_for_pair(prev.uuid, version.uuid).await? {
                Some(diff) => println!("diff:         {}", diff.uuid),
                None => println!("diff:         (pending)"),
            }
        }
        None => println!("predecessor:  (none, oldest capture)"),
    }

    store.close().await;
    Ok(())
}

pub async fn run_get_diff(config: &Config, id: &str, show_content: bool) -> Result<()> {
    let store = open(config).await?;
    let diff = store.get_diff(parse_uuid("diff", id)?).await?;
    let annotations = store.annotations_for_diff(diff.uuid).await?;

    println!("--- Diff ---");
    print_diff(&diff);
    println!();

    println!("--- Annotations ({}) ---", annotations.len());
    for note in &annotations {
        println!("[{}] {} {}", format_ts(note.created_at), note.author, note.uuid);
        println!("{}", note.content);
        println!();
    }

    if show_content {
        let diff = PayloadStore::new(&config.storage.payload_dir)
            .load_content(diff)
            .await?;
        println!("--- Content ---");
        if let Some(content) = &diff.content {
            println!("{}", serde_json::to_string_pretty(content)?);
        }
    }

    store.close().await;
    Ok(())
}

/// Print a Page's Versions, newest first.
pub async fn run_history(config: &Config, key: &str) -> Result<()> {
    let store = open(config).await?;
    let page = resolve_page(&store, key).await?;
    let history = store.history(page.uuid).await?;

    println!("{} ({} versions)", page.url, history.len());
    println!("  {:<20} {:<36}  {}", "CAPTURED", "VERSION", "HASH");
    println!("  {}", "-".repeat(76));
    for version in &history {
        println!(
            "  {:<20} {:<36}  {}",
            format_ts(version.capture_time),
            version.uuid,
            short_hash(&version.version_hash)
        );
    }

    store.close().await;
    Ok(())
}

pub fn print_page(page: &Page) {
    println!("uuid:         {}", page.uuid);
    println!("url:          {}", page.url);
    println!(
        "title:        {}",
        if page.title.is_empty() { "(untitled)" } else { page.title.as_str() }
    );
    println!("agency:       {}", page.agency);
    println!("site:         {}", page.site);
}

pub fn print_version(version: &Version) {
    println!("uuid:         {}", version.uuid);
    println!("page:         {}", version.page_uuid);
    println!("captured:     {}", format_ts(version.capture_time));
    println!("uri:          {}", version.uri);
    println!("version_hash: {}", version.version_hash);
    println!("source_type:  {}", version.source_type);
    println!("metadata:     {}", version.source_metadata);
}

pub fn print_diff(diff: &Diff) {
    println!("uuid:         {}", diff.uuid);
    println!("from:         {}", diff.version_from);
    println!("to:           {}", diff.version_to);
    println!("diffhash:     {}", diff.diffhash);
    println!("uri:          {}", diff.uri);
    println!("source_type:  {}", diff.source_type);
    match diff.priority {
        Some(p) => println!("priority:     {:.4}", p),
        None => println!("priority:     (unset)"),
    }
    println!("metadata:     {}", diff.source_metadata);
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
