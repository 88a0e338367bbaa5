//! ETL Ingest Library
//!
//! Incremental extraction from REST APIs, delimited files and RSS/Atom feeds
//! into one unified item table.
//!
//! # Pipeline
//!
//! - **Sources** ([`source`]): fetch payloads past a per-source watermark
//! - **Raw store** ([`store`]): payloads are persisted before any transform
//! - **Normalizer** ([`normalizer`]): maps raw payloads onto [`models::NormalizedItem`]
//! - **Loader** ([`loader`]): idempotent upsert keyed by source and external id
//! - **Orchestrator** ([`orchestrator`]): one run per source, advancing the
//!   checkpoint only after a successful load
//! - **Scheduler** ([`scheduler`]): periodic, concurrent runs over all sources
//!
//! # Example
//!
//! ```no_run
//! use etl_ingest::config::{FeedSourceConfig, PipelineConfig, SourceConfig};
//! use etl_ingest::orchestrator::RunOrchestrator;
//! use etl_ingest::source::build_source;
//! use etl_ingest::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = PipelineConfig::default();
//!     let feed = SourceConfig::Feed(FeedSourceConfig::new("news", "https://example.com/rss"));
//!     let mut source = build_source(&feed, &pipeline)?;
//!
//!     let orchestrator = RunOrchestrator::from_config(Arc::new(MemoryStore::new()), &pipeline);
//!     let summary = orchestrator.run(source.as_mut()).await?;
//!     println!("{} loaded", summary.records_loaded);
//!     Ok(())
//! }
//! ```
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod loader;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod scheduler;
pub mod source;
pub mod store;

pub use orchestrator::{RunOrchestrator, RunSummary};
pub use scheduler::{Scheduler, SourceOutcome};
pub use store::{MemoryStore, PgStore, PipelineStore};
