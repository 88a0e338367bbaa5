//! RSS 2.0 / Atom feed source
//!
//! Entries are flattened to `{id, title, description, link, author,
//! published, categories, content}` objects before they reach the
//! normalizer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_common::watermark::{format_timestamp, parse_timestamp};
use etl_common::{EtlError, ErrorKind, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::info;

use super::{field_text, field_timestamp, SourceClient};
use crate::config::FeedSourceConfig;
use crate::models::{Payload, SourceKind, WatermarkType};

/// One parsed feed entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub content: Option<String>,
}

impl FeedEntry {
    /// Publication instant, falling back to the update instant.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.published.or(self.updated)
    }

    pub fn into_payload(self) -> Payload {
        let published = self.date().map(|d| format_timestamp(&d));
        json!({
            "id": self.id.or_else(|| self.link.clone()),
            "title": self.title,
            "description": self.description,
            "link": self.link,
            "author": self.author,
            "published": published,
            "categories": self.categories,
            "content": self.content,
        })
    }
}

/// Syndication feed client
pub struct FeedSource {
    config: FeedSourceConfig,
    client: Client,
}

impl FeedSource {
    pub fn new(config: FeedSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("etl-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                EtlError::configuration("Failed to build HTTP client")
                    .with_context("source", &config.name)
                    .with_source(e)
            })?;

        Ok(Self { config, client })
    }

    async fn download(&self) -> Result<String> {
        let response = self.client.get(&self.config.url).send().await.map_err(|e| {
            EtlError::network("Feed request failed")
                .with_context("url", &self.config.url)
                .with_context("source", &self.config.name)
                .with_source(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let err = match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    EtlError::authentication("Feed requires authentication")
                },
                StatusCode::NOT_FOUND => EtlError::not_found("Feed not found"),
                s if s.is_server_error() => EtlError::network(format!("Feed server error {}", s.as_u16())),
                s => EtlError::unexpected(
                    ErrorKind::Extraction,
                    format!("Unexpected HTTP status {}", s.as_u16()),
                ),
            };
            return Err(err
                .with_context("url", &self.config.url)
                .with_context("source", &self.config.name)
                .with_context("status", status.as_u16()));
        }

        response.text().await.map_err(|e| {
            EtlError::network("Failed to read feed body")
                .with_context("url", &self.config.url)
                .with_context("source", &self.config.name)
                .with_source(e)
        })
    }
}

#[async_trait]
impl SourceClient for FeedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn watermark_type(&self) -> WatermarkType {
        WatermarkType::Timestamp
    }

    async fn fetch(&mut self, watermark: Option<&str>) -> Result<Vec<Payload>> {
        let body = self.download().await?;
        let entries = parse_feed(&body).map_err(|e| {
            e.with_context("url", &self.config.url)
                .with_context("source", &self.config.name)
        })?;

        let since = watermark.and_then(parse_timestamp);
        let total = entries.len();
        let payloads: Vec<Payload> = entries
            .into_iter()
            .filter(|entry| match (entry.date(), since) {
                (Some(date), Some(since)) => date > since,
                _ => true,
            })
            .map(FeedEntry::into_payload)
            .collect();

        info!(
            source = %self.config.name,
            total,
            new = payloads.len(),
            "Parsed feed entries"
        );

        Ok(payloads)
    }

    fn external_id(&self, payload: &Payload) -> String {
        field_text(payload, "id")
            .filter(|id| !id.is_empty())
            .or_else(|| field_text(payload, "link"))
            .unwrap_or_default()
    }

    fn extract_timestamp(&self, payload: &Payload) -> Option<DateTime<Utc>> {
        field_timestamp(payload, "published")
    }
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).to_lowercase()
}

fn attribute(start: &BytesStart<'_>, name: &str) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name.as_bytes())
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.trim().to_string()))
        .filter(|v| !v.is_empty())
}

fn set_once(slot: &mut Option<String>, value: &str) {
    if slot.is_none() && !value.is_empty() {
        *slot = Some(value.to_string());
    }
}

/// Attribute-carried data (Atom `link@href`, `category@term`).
fn apply_attributes(entry: &mut FeedEntry, name: &str, start: &BytesStart<'_>) {
    match name {
        "link" => {
            let rel = attribute(start, "rel");
            if matches!(rel.as_deref(), None | Some("alternate")) {
                if let Some(href) = attribute(start, "href") {
                    set_once(&mut entry.link, &href);
                }
            }
        },
        "category" => {
            if let Some(term) = attribute(start, "term") {
                entry.categories.push(term);
            }
        },
        _ => {},
    }
}

/// Text-carried data, keyed by element name and its parent.
fn apply_text(entry: &mut FeedEntry, name: &str, parent: Option<&str>, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }

    match (name, parent) {
        ("name", Some("author")) => set_once(&mut entry.author, text),
        (_, Some(_)) => {},
        ("guid" | "id", None) => set_once(&mut entry.id, text),
        ("title", None) => set_once(&mut entry.title, text),
        ("link", None) => set_once(&mut entry.link, text),
        ("description" | "summary", None) => set_once(&mut entry.description, text),
        ("author" | "creator", None) => set_once(&mut entry.author, text),
        ("category" | "subject", None) => entry.categories.push(text.to_string()),
        ("encoded" | "content", None) => set_once(&mut entry.content, text),
        ("pubdate" | "published" | "issued", None) => {
            if entry.published.is_none() {
                entry.published = parse_timestamp(text);
            }
        },
        ("updated" | "date" | "modified", None) => {
            if entry.updated.is_none() {
                entry.updated = parse_timestamp(text);
            }
        },
        _ => {},
    }
}

fn parse_error(reader: &Reader<&[u8]>, err: quick_xml::Error) -> EtlError {
    EtlError::parse("Failed to parse feed")
        .with_context("position", reader.error_position())
        .with_source(err)
}

/// Parse an RSS 2.0, RSS 1.0 or Atom document into entries.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root: Option<String> = None;
    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;
    // Element names open inside the current entry
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = local_name(&start);
                if root.is_none() {
                    root = Some(name.clone());
                }
                if let Some(entry) = current.as_mut() {
                    if stack.is_empty() {
                        apply_attributes(entry, &name, &start);
                    }
                    stack.push(name);
                } else if name == "item" || name == "entry" {
                    current = Some(FeedEntry::default());
                    stack.clear();
                }
                text.clear();
            },
            Ok(Event::Empty(start)) => {
                let name = local_name(&start);
                if root.is_none() {
                    root = Some(name.clone());
                }
                if let Some(entry) = current.as_mut() {
                    if stack.is_empty() {
                        apply_attributes(entry, &name, &start);
                    }
                }
            },
            Ok(Event::Text(t)) => {
                if current.is_some() {
                    let unescaped = t.unescape().map_err(|e| parse_error(&reader, e))?;
                    text.push_str(&unescaped);
                }
            },
            Ok(Event::CData(c)) => {
                if current.is_some() {
                    text.push_str(&String::from_utf8_lossy(c.as_ref()));
                }
            },
            Ok(Event::End(end)) => {
                let name = String::from_utf8_lossy(end.local_name().as_ref()).to_lowercase();
                if current.is_some() && stack.is_empty() {
                    if name == "item" || name == "entry" {
                        entries.extend(current.take());
                    }
                } else if let Some(entry) = current.as_mut() {
                    stack.pop();
                    let parent = stack.last().map(String::as_str);
                    apply_text(entry, &name, parent, &text);
                }
                text.clear();
            },
            Ok(Event::Eof) => break,
            Ok(_) => {},
            Err(e) => return Err(parse_error(&reader, e)),
        }
    }

    match root.as_deref() {
        Some("rss" | "feed" | "rdf") => Ok(entries),
        Some(other) => Err(EtlError::parse(format!("Not an RSS or Atom document (root <{}>)", other))),
        None => Err(EtlError::parse("Empty feed document")),
    }
}
