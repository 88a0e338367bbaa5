//! Delimited file source

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_common::watermark::{id_exceeds, parse_timestamp};
use etl_common::{EtlError, ErrorKind, Result};
use serde_json::{Map, Number};
use std::path::PathBuf;
use tracing::{info, warn};

use super::{field_text, field_timestamp, SourceClient};
use crate::config::FileSourceConfig;
use crate::models::{Payload, SourceKind, WatermarkType};

/// Reads rows from a CSV (or other delimited) file
pub struct FileSource {
    config: FileSourceConfig,
    delimiter: u8,
}

impl FileSource {
    pub fn new(config: FileSourceConfig) -> Result<Self> {
        let delimiter = u8::try_from(config.delimiter).map_err(|_| {
            EtlError::configuration("Delimiter must be a single ASCII character")
                .with_context("source", &config.name)
        })?;
        Ok(Self { config, delimiter })
    }

    /// Whether a row lies past the watermark. Rows without a comparable
    /// value are kept.
    fn is_new(&self, row: &Payload, watermark: &str) -> bool {
        match self.config.timestamp_column {
            Some(_) => match (self.extract_timestamp(row), parse_timestamp(watermark)) {
                (Some(ts), Some(mark)) => ts > mark,
                _ => true,
            },
            None => {
                let id = self.external_id(row);
                id.is_empty() || id_exceeds(&id, watermark)
            },
        }
    }
}

/// Lowercase, trim and replace spaces with underscores.
pub fn normalize_header(header: &str) -> String {
    header.trim().to_lowercase().replace(' ', "_")
}

/// Infer a JSON value from a cell: empty is null, then integer, float, text.
///
/// Integers too wide for `u64` stay text so ids keep every digit.
pub fn infer_cell(cell: &str) -> Payload {
    let cell = cell.trim();
    if cell.is_empty() {
        return Payload::Null;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Payload::Number(int.into());
    }
    if let Ok(int) = cell.parse::<u64>() {
        return Payload::Number(int.into());
    }
    if is_integer_literal(cell) {
        return Payload::String(cell.to_string());
    }
    if let Ok(float) = cell.parse::<f64>() {
        if let Some(number) = Number::from_f64(float) {
            return Payload::Number(number);
        }
    }
    Payload::String(cell.to_string())
}

fn is_integer_literal(cell: &str) -> bool {
    let digits = cell.strip_prefix(['-', '+']).unwrap_or(cell);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn read_rows(path: PathBuf, delimiter: u8) -> std::result::Result<Vec<Payload>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(normalize_header).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = Map::new();
        for (header, cell) in headers.iter().zip(record.iter()) {
            row.insert(header.clone(), infer_cell(cell));
        }
        rows.push(Payload::Object(row));
    }

    Ok(rows)
}

#[async_trait]
impl SourceClient for FileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn watermark_type(&self) -> WatermarkType {
        if self.config.timestamp_column.is_some() {
            WatermarkType::Timestamp
        } else {
            WatermarkType::Id
        }
    }

    async fn fetch(&mut self, watermark: Option<&str>) -> Result<Vec<Payload>> {
        let path = self.config.path.clone();
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if !exists {
            warn!(source = %self.config.name, path = %path.display(), "File not found, nothing to read");
            return Ok(Vec::new());
        }

        let delimiter = self.delimiter;
        let rows = tokio::task::spawn_blocking({
            let path = path.clone();
            move || read_rows(path, delimiter)
        })
        .await
        .map_err(|e| {
            EtlError::unexpected(ErrorKind::Extraction, "File reader task failed")
                .with_context("source", &self.config.name)
                .with_source(e)
        })?
        .map_err(|e| {
            EtlError::parse("Failed to read delimited file")
                .with_context("source", &self.config.name)
                .with_context("path", path.display())
                .with_source(e)
        })?;

        let total = rows.len();
        let rows: Vec<Payload> = match watermark.filter(|w| !w.is_empty()) {
            Some(mark) => rows.into_iter().filter(|row| self.is_new(row, mark)).collect(),
            None => rows,
        };

        info!(
            source = %self.config.name,
            total,
            new = rows.len(),
            "Read rows from file"
        );

        Ok(rows)
    }

    fn external_id(&self, payload: &Payload) -> String {
        field_text(payload, &self.config.id_column).unwrap_or_default()
    }

    fn extract_timestamp(&self, payload: &Payload) -> Option<DateTime<Utc>> {
        self.config
            .timestamp_column
            .as_deref()
            .and_then(|column| field_timestamp(payload, column))
    }
}
