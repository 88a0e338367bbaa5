//! Data models for the pipeline
//!
//! Checkpoints, raw records, unified items and run audit records, plus the
//! text-backed enums they share. Enums are stored as lowercase `TEXT`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Raw payloads exchanged with sources are arbitrary JSON documents.
pub type Payload = serde_json::Value;

/// Unrecognised enum text read from storage or configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

macro_rules! text_enum_conversions {
    ($($ty:ty),+ $(,)?) => {$(
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<String> for $ty {
            type Error = ParseEnumError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    )+};
}

/// Source variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    File,
    Feed,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Api => "api",
            SourceKind::File => "file",
            SourceKind::Feed => "feed",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api" => Ok(SourceKind::Api),
            "file" | "csv" => Ok(SourceKind::File),
            "feed" | "rss" => Ok(SourceKind::Feed),
            _ => Err(ParseEnumError::new("source kind", s)),
        }
    }
}

/// How a checkpoint's watermark value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkType {
    Timestamp,
    Id,
}

impl WatermarkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkType::Timestamp => "timestamp",
            WatermarkType::Id => "id",
        }
    }
}

impl std::str::FromStr for WatermarkType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "timestamp" => Ok(WatermarkType::Timestamp),
            "id" => Ok(WatermarkType::Id),
            _ => Err(ParseEnumError::new("watermark type", s)),
        }
    }
}

/// Run and checkpoint status
///
/// `Pending -> Running -> {Success, Partial, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::Partial)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "partial" => Ok(RunStatus::Partial),
            _ => Err(ParseEnumError::new("run status", s)),
        }
    }
}

/// Lifecycle status of a unified item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Active,
    Inactive,
    Deleted,
    Pending,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Active => "active",
            ItemStatus::Inactive => "inactive",
            ItemStatus::Deleted => "deleted",
            ItemStatus::Pending => "pending",
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(ItemStatus::Active),
            "inactive" => Ok(ItemStatus::Inactive),
            "deleted" => Ok(ItemStatus::Deleted),
            "pending" => Ok(ItemStatus::Pending),
            _ => Err(ParseEnumError::new("item status", s)),
        }
    }
}

text_enum_conversions!(SourceKind, WatermarkType, RunStatus, ItemStatus);

/// Per-source incremental progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Checkpoint {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub source_kind: SourceKind,
    pub source_name: String,
    #[sqlx(try_from = "String")]
    pub watermark_type: WatermarkType,
    pub watermark_value: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: RunStatus,
    pub total_runs: i64,
    pub total_records_processed: i64,
    pub last_records_processed: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Watermark value, treating an empty string as absent.
    pub fn watermark(&self) -> Option<&str> {
        self.watermark_value.as_deref().filter(|v| !v.is_empty())
    }
}

/// Terminal checkpoint update written at the end of a run
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointAdvance {
    pub source_kind: SourceKind,
    pub source_name: String,
    pub watermark_type: WatermarkType,
    pub watermark_value: Option<String>,
    pub status: RunStatus,
    pub records_processed: i64,
    pub error_message: Option<String>,
}

/// Immutable fetched payload plus its processing flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawRecord {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub source_kind: SourceKind,
    pub source_name: String,
    pub source_id: Option<String>,
    pub payload: Payload,
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub run_id: Uuid,
}

/// Raw payload about to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewRawRecord {
    pub source_id: Option<String>,
    pub payload: Payload,
    pub content_hash: String,
}

/// Normalized item ready for the loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub source_kind: SourceKind,
    pub source_name: String,
    pub external_id: String,
    pub raw_record_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub author: Option<String>,
    pub amount: Option<f64>,
    pub quantity: Option<i64>,
    pub rating: Option<f64>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: ItemStatus,
    pub published_at: Option<DateTime<Utc>>,
}

/// Unified item as stored, keyed by (source kind, source name, external id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UnifiedItem {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub source_kind: SourceKind,
    pub source_name: String,
    pub external_id: String,
    pub raw_record_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub author: Option<String>,
    pub amount: Option<f64>,
    pub quantity: Option<i64>,
    pub rating: Option<f64>,
    #[sqlx(json)]
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    #[sqlx(try_from = "String")]
    pub status: ItemStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub run_id: Option<Uuid>,
}

/// Audit record of one orchestrator invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Run {
    pub run_id: Uuid,
    #[sqlx(try_from = "String")]
    pub source_kind: SourceKind,
    pub source_name: String,
    #[sqlx(try_from = "String")]
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub records_extracted: i64,
    pub records_transformed: i64,
    pub records_loaded: i64,
    pub records_failed: i64,
    pub watermark_before: Option<String>,
    pub watermark_after: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
}

impl Run {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}

/// A raw record that failed normalization, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub raw_record_id: i64,
    pub error: String,
}

/// Terminal state written once when a run finishes
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub records_extracted: i64,
    pub records_transformed: i64,
    pub records_loaded: i64,
    pub records_failed: i64,
    pub watermark_after: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Vec<RecordFailure>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Pending.to_string(), "pending");
        assert_eq!(RunStatus::Running.to_string(), "running");
        assert_eq!(RunStatus::Success.to_string(), "success");
        assert_eq!(RunStatus::Failed.to_string(), "failed");
        assert_eq!(RunStatus::Partial.to_string(), "partial");
    }

    #[test]
    fn test_run_status_from_str() {
        assert_eq!("SUCCESS".parse::<RunStatus>().unwrap(), RunStatus::Success);
        assert_eq!("partial".parse::<RunStatus>().unwrap(), RunStatus::Partial);
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_source_kind_accepts_legacy_names() {
        assert_eq!("csv".parse::<SourceKind>().unwrap(), SourceKind::File);
        assert_eq!("rss".parse::<SourceKind>().unwrap(), SourceKind::Feed);
        assert_eq!(SourceKind::try_from("api".to_string()).unwrap(), SourceKind::Api);
    }

    #[test]
    fn test_item_status_parse_error_names_the_type() {
        let err = "archived".parse::<ItemStatus>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid item status: archived");
    }

    #[test]
    fn test_checkpoint_empty_watermark_is_absent() {
        let now = Utc::now();
        let mut checkpoint = Checkpoint {
            id: 1,
            source_kind: SourceKind::Api,
            source_name: "catalog".to_string(),
            watermark_type: WatermarkType::Timestamp,
            watermark_value: Some(String::new()),
            status: RunStatus::Success,
            total_runs: 1,
            total_records_processed: 0,
            last_records_processed: 0,
            last_run_at: Some(now),
            last_success_at: Some(now),
            last_failure_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        assert_eq!(checkpoint.watermark(), None);
        checkpoint.watermark_value = Some("2024-01-01T00:00:00Z".to_string());
        assert_eq!(checkpoint.watermark(), Some("2024-01-01T00:00:00Z"));
        assert!(!checkpoint.is_running());
    }
}
