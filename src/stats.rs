//! Store statistics.
//!
//! `wm stats` prints entity counts, the depth of both work queues, and how
//! many Versions were skipped or dead-lettered. Useful after a run to check
//! that the queues are draining.

use anyhow::Result;
use web_monitoring_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let stats = store.stats().await?;
    store.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let prioritized = stats.diffs.saturating_sub(stats.unprocessed_diffs);

    println!("Web Monitoring Database Stats");
    println!("=============================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!("  Payloads:     {}", config.storage.payload_dir.display());
    println!();
    println!("  Pages:        {}", stats.pages);
    println!("  Versions:     {}", stats.versions);
    println!("  Diffs:        {}", stats.diffs);
    println!(
        "  Prioritized:  {} / {} ({}%)",
        prioritized,
        stats.diffs,
        if stats.diffs > 0 {
            (prioritized * 100) / stats.diffs
        } else {
            0
        }
    );
    println!("  Annotations:  {}", stats.annotations);
    println!();
    println!("  Queues:");
    println!("    unprocessed versions: {}", stats.unprocessed_versions);
    println!("    unprocessed diffs:    {}", stats.unprocessed_diffs);
    println!("    no ancestor:          {}", stats.no_ancestor);
    println!("    dead letters:         {}", stats.dead_letters);
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
