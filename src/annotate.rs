//! Reviewer annotations from the command line.

use anyhow::{bail, Result};
use web_monitoring_core::models::{Annotation, NewAnnotation};
use web_monitoring_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::get::{format_ts, parse_uuid};
use crate::sqlite_store::SqliteStore;

/// Interpret `--content`: JSON if it parses, otherwise a plain string.
pub fn parse_content(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

pub async fn run_annotate(config: &Config, diff: &str, author: &str, content: &str) -> Result<()> {
    if author.trim().is_empty() {
        bail!("--author must not be empty");
    }
    let store = SqliteStore::new(db::connect(config).await?);
    let diff_uuid = parse_uuid("diff", diff)?;

    let id = store
        .insert_annotation(&NewAnnotation {
            uuid: None,
            diff_uuid,
            author: author.to_string(),
            content: parse_content(content),
        })
        .await?;

    println!("annotation {}", id);
    println!("  diff: {}", diff_uuid);
    println!("  author: {}", author);
    println!("ok");

    store.close().await;
    Ok(())
}

/// List annotations for a Diff, or for the change between two Versions.
pub async fn run_list_annotations(
    config: &Config,
    diff: Option<&str>,
    change: Option<(&str, &str)>,
) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);

    let notes: Vec<Annotation> = match (diff, change) {
        (Some(diff), None) => {
            store
                .annotations_for_diff(parse_uuid("diff", diff)?)
                .await?
        }
        (None, Some((from, to))) => {
            store
                .annotations_for_change(parse_uuid("version", from)?, parse_uuid("version", to)?)
                .await?
        }
        _ => bail!("Pass either --diff or both --from and --to"),
    };

    if notes.is_empty() {
        println!("No annotations.");
    }
    for note in &notes {
        println!("{}  {}  {}", format_ts(note.created_at), note.author, note.uuid);
        println!("  {}", note.content);
    }

    store.close().await;
    Ok(())
}
