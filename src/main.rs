//! # Web Monitoring CLI (`wm`)
//!
//! ## Usage
//!
//! ```bash
//! wm --config ./config/wm.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wm init` | Create the SQLite database and run schema migrations |
//! | `wm ingest <file> --url <url>` | Record a captured HTML file as a new Version |
//! | `wm diff` | Diff every unprocessed Version against its predecessor |
//! | `wm triage` | Score every unprioritized Diff |
//! | `wm watch` | Run diff and triage workers until Ctrl-C |
//! | `wm queue` | Show the ranked review queue |
//! | `wm annotate <diff>` | Attach a reviewer annotation to a Diff |
//! | `wm annotations` | List annotations for a Diff or a change |
//! | `wm get page\|version\|diff <id>` | Show one record |
//! | `wm history <page>` | List a Page's Versions, newest first |
//! | `wm dead-letters` | List (or `--requeue`) dead-lettered Versions |
//! | `wm stats` | Entity counts and queue depths |
//! | `wm serve` | Start the HTTP API |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `web_monitoring=info`).

use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use web_monitoring::{
    annotate, config, get, ingest, migrate, pipeline, review, server, stats, triage, watch,
};

/// Web Monitoring CLI: track changes to web pages over time.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/wm.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "wm",
    about = "Track changes to web pages: ingest captures, diff versions, triage and annotate changes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/wm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Record a captured HTML file as a new Version of its Page.
    ///
    /// The Page is created on first sight of `--url`; later captures of the
    /// same url reuse it and its metadata.
    Ingest {
        /// Path to the captured HTML file.
        file: PathBuf,

        /// The monitored page's url.
        #[arg(long)]
        url: String,

        #[arg(long, default_value = "")]
        title: String,

        #[arg(long, default_value = "")]
        agency: String,

        #[arg(long, default_value = "")]
        site: String,

        /// Capture time, RFC 3339. Defaults to now.
        #[arg(long)]
        capture_time: Option<String>,

        #[arg(long, default_value = "file")]
        source_type: String,

        /// Extra metadata as a JSON object.
        #[arg(long, default_value = "{}")]
        metadata: String,
    },

    /// Diff unprocessed Versions against their predecessors.
    Diff {
        /// Stop after this many Versions.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Assign priorities to unprioritized Diffs.
    Triage {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run the diff and triage workers until Ctrl-C.
    Watch,

    /// Show prioritized Diffs, highest priority first.
    Queue {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Attach an annotation to a Diff.
    Annotate {
        /// Diff uuid.
        diff: String,

        #[arg(long)]
        author: String,

        /// JSON value, or plain text stored as a string.
        #[arg(long)]
        content: String,
    },

    /// List annotations for a Diff, or for the change between two Versions.
    Annotations {
        #[arg(long, conflicts_with_all = ["from", "to"])]
        diff: Option<String>,

        #[arg(long, requires = "to")]
        from: Option<String>,

        #[arg(long, requires = "from")]
        to: Option<String>,
    },

    /// Show one record.
    Get {
        #[command(subcommand)]
        what: GetTarget,
    },

    /// List a Page's Versions, newest first.
    History {
        /// Page uuid or url.
        page: String,
    },

    /// List Versions that exhausted their retries.
    DeadLetters {
        /// Put every dead-lettered Version back in the queue.
        #[arg(long)]
        requeue: bool,
    },

    /// Show entity counts and queue depths.
    Stats {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum GetTarget {
    /// A Page, by uuid or url.
    Page { key: String },
    Version { id: String },
    Diff {
        id: String,
        /// Also print the stored diff payload.
        #[arg(long)]
        content: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "web_monitoring=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            file,
            url,
            title,
            agency,
            site,
            capture_time,
            source_type,
            metadata,
        } => {
            let capture_time = match capture_time {
                Some(raw) => ingest::parse_capture_time(&raw)?,
                None => Utc::now(),
            };
            let source_metadata: serde_json::Value =
                serde_json::from_str(&metadata).context("--metadata must be a JSON object")?;
            if !source_metadata.is_object() {
                anyhow::bail!("--metadata must be a JSON object");
            }
            let input = ingest::CaptureInput {
                path: file,
                url,
                title,
                agency,
                site,
                capture_time,
                source_type,
                source_metadata,
            };
            ingest::run_ingest(&cfg, input).await?;
        }
        Commands::Diff { limit } => {
            pipeline::run_diff(&cfg, limit).await?;
        }
        Commands::Triage { limit } => {
            triage::run_triage(&cfg, limit).await?;
        }
        Commands::Watch => {
            watch::run_watch(&cfg).await?;
        }
        Commands::Queue { limit } => {
            review::run_queue(&cfg, limit).await?;
        }
        Commands::Annotate {
            diff,
            author,
            content,
        } => {
            annotate::run_annotate(&cfg, &diff, &author, &content).await?;
        }
        Commands::Annotations { diff, from, to } => {
            let change = from.as_deref().zip(to.as_deref());
            annotate::run_list_annotations(&cfg, diff.as_deref(), change).await?;
        }
        Commands::Get { what } => match what {
            GetTarget::Page { key } => get::run_get_page(&cfg, &key).await?,
            GetTarget::Version { id } => get::run_get_version(&cfg, &id).await?,
            GetTarget::Diff { id, content } => get::run_get_diff(&cfg, &id, content).await?,
        },
        Commands::History { page } => {
            get::run_history(&cfg, &page).await?;
        }
        Commands::DeadLetters { requeue } => {
            pipeline::run_dead_letters(&cfg, requeue).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
