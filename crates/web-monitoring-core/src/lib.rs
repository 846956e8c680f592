//! # Web Monitoring Core
//!
//! Shared, runtime-free logic for web-monitoring: the Page / Version / Diff /
//! Annotation data model, the error taxonomy, the [`store::Store`]
//! abstraction with an in-memory implementation, and the pluggable
//! [`scoring::Scorer`] strategy used by priority triage.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! application crate supplies the SQLite store, the diffing-service client,
//! payload storage, and the worker loops.

pub mod error;
pub mod models;
pub mod scoring;
pub mod store;

pub use error::{Error, Result};
