//! # Web Monitoring
//!
//! Tracks changes to web pages over time. Captured HTML files become
//! Versions of a Page; consecutive Versions are diffed through an external
//! diffing service; each Diff gets a review priority from a pluggable
//! scorer; reviewers annotate the Diffs they look at.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐   ┌──────────────┐
//! │  ingest  │──▶│    SQLite    │──▶│   diff   │──▶│ diff service │
//! │ captures │   │ pages/vers.  │◀──│ pipeline │◀──│  (HTTP)      │
//! └──────────┘   │ diffs/notes  │   └────┬─────┘   └──────────────┘
//!                └──────┬───────┘        ▼
//!                       │          ┌──────────┐
//!                       │◀─────────│  triage  │ (Scorer)
//!                       ▼          └──────────┘
//!               ┌──────────────┐
//!               │ CLI  /  HTTP │ review queue, annotations
//!               └──────────────┘
//! ```
//!
//! The work queues are queries over the store, not separate structures;
//! see [`web_monitoring_core::store`].
//!
//! ## Quick Start
//!
//! ```bash
//! wm init
//! wm ingest capture.html --url https://www.epa.gov/ --capture-time 2017-01-20T12:00:00Z
//! wm diff                       # diff unprocessed versions
//! wm triage                     # score unprioritized diffs
//! wm queue                      # ranked review queue
//! wm serve                      # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | SQLite implementation of the `Store` trait |
//! | [`ingest`] | Capture files to Versions |
//! | [`payload`] | Content-addressed diff payload files |
//! | [`diff_service`] | Diffing service client with retry |
//! | [`queue`] | Claims over the derived work queues |
//! | [`pipeline`] | Diff pipeline |
//! | [`triage`] | Priority triage |
//! | [`review`] | Reviewer checkout |
//! | [`annotate`] / [`get`] / [`stats`] | CLI commands |
//! | [`watch`] | Long-running worker loops |
//! | [`server`] | HTTP API |

pub mod annotate;
pub mod config;
pub mod db;
pub mod diff_service;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod payload;
pub mod pipeline;
pub mod queue;
pub mod review;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod triage;
pub mod watch;
