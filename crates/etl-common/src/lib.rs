//! ETL Common Library
//!
//! Shared error handling, logging and watermark utilities for the ETL workspace.
//!
//! # Overview
//!
//! - **Error Handling**: a single tagged [`EtlError`] carrying a phase
//!   ([`ErrorKind`]) and a retryable flag
//! - **Checksums**: content hashing for raw payload deduplication
//! - **Watermarks**: timestamp parsing and id ordering used by checkpoints
//! - **Logging**: `tracing` subscriber bootstrap
//!
//! # Example
//!
//! ```no_run
//! use etl_common::{EtlError, Result};
//! use etl_common::checksum::payload_hash;
//!
//! fn fingerprint(payload: &serde_json::Value) -> Result<String> {
//!     if payload.is_null() {
//!         return Err(EtlError::validation("payload is null"));
//!     }
//!     Ok(payload_hash(payload))
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod watermark;

// Re-export commonly used types
pub use error::{Cause, ErrorKind, EtlError, Result};
