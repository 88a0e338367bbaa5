//! Paginated JSON API source
//!
//! Requests carry a bearer token plus `since` and `page` query parameters.
//! Each page request goes through the retry policy and the circuit breaker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_common::{EtlError, Result};
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::resilience::{parse_retry_after, CircuitBreaker, RetryPolicy};
use super::{field_text, field_timestamp, SourceClient};
use crate::config::{ApiSourceConfig, DEFAULT_MAX_RETRIES};
use crate::models::{Payload, SourceKind, WatermarkType};

/// Response bodies are truncated to this many characters in error context
const MAX_BODY_CHARS: usize = 500;

/// Outcome of a single HTTP attempt that did not succeed
enum AttemptFailure {
    Transport(reqwest::Error),
    Server { status: StatusCode, body: String },
    RateLimited { retry_after: Option<Duration> },
    Fatal(EtlError),
}

/// REST API client with retry, backoff and circuit breaking
pub struct ApiSource {
    config: ApiSourceConfig,
    client: Client,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ApiSource {
    pub fn new(config: ApiSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("etl-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                EtlError::configuration("Failed to build HTTP client")
                    .with_context("source", &config.name)
                    .with_source(e)
            })?;

        let policy = RetryPolicy {
            max_attempts: config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        };
        let breaker = CircuitBreaker::new(
            config.breaker_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        );

        Ok(Self {
            config,
            client,
            policy,
            breaker,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch one page, retrying transient failures.
    async fn request_page(&mut self, watermark: Option<&str>, page: u32) -> Result<Payload> {
        let now = Instant::now();
        if !self.breaker.allows(now) {
            let retry_in = self.breaker.remaining(now).unwrap_or_default();
            return Err(EtlError::circuit_open(format!(
                "Circuit breaker is open for {}",
                self.config.name
            ))
            .with_context("source", &self.config.name)
            .with_context("url", &self.config.url)
            .with_context("retry_in_secs", retry_in.as_secs()));
        }

        let mut query: Vec<(&str, String)> = Vec::with_capacity(2);
        if let Some(since) = watermark {
            query.push(("since", since.to_string()));
        }
        query.push(("page", page.to_string()));

        for attempt in 0..self.policy.max_attempts {
            let last = self.policy.is_last_attempt(attempt);
            debug!(
                source = %self.config.name,
                page,
                attempt = attempt + 1,
                max_attempts = self.policy.max_attempts,
                "Requesting page"
            );

            match self.attempt(&query).await {
                Ok(body) => {
                    self.breaker.record_success();
                    return self.parse_body(&body, page);
                },
                Err(AttemptFailure::Fatal(err)) => {
                    self.breaker.record_failure(Instant::now());
                    return Err(err
                        .with_context("url", &self.config.url)
                        .with_context("source", &self.config.name));
                },
                Err(AttemptFailure::RateLimited { retry_after }) => {
                    let hint = retry_after.unwrap_or_else(|| self.policy.backoff(attempt));
                    if last {
                        self.breaker.record_failure(Instant::now());
                        return Err(EtlError::rate_limited("Rate limit exceeded", Some(hint))
                            .with_context("url", &self.config.url)
                            .with_context("source", &self.config.name)
                            .with_context("attempts", attempt + 1)
                            .with_context("retry_after_secs", hint.as_secs()));
                    }
                    let delay = self.policy.rate_limit_delay(attempt, retry_after);
                    warn!(
                        source = %self.config.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(AttemptFailure::Server { status, body }) => {
                    if last {
                        self.breaker.record_failure(Instant::now());
                        return Err(EtlError::network(format!(
                            "Server error {} after {} attempts",
                            status.as_u16(),
                            attempt + 1
                        ))
                        .with_context("url", &self.config.url)
                        .with_context("source", &self.config.name)
                        .with_context("attempts", attempt + 1)
                        .with_context("status", status.as_u16())
                        .with_context("response_body", truncate(&body)));
                    }
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        source = %self.config.name,
                        status = status.as_u16(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Server error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(AttemptFailure::Transport(err)) => {
                    let what = if err.is_timeout() {
                        "Request timed out"
                    } else {
                        "Request failed"
                    };
                    if last {
                        self.breaker.record_failure(Instant::now());
                        return Err(EtlError::network(format!(
                            "{} after {} attempts",
                            what,
                            attempt + 1
                        ))
                        .with_context("url", &self.config.url)
                        .with_context("source", &self.config.name)
                        .with_context("attempts", attempt + 1)
                        .with_source(err));
                    }
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        source = %self.config.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "{}, retrying", what
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }

        Err(EtlError::network("Retry budget exhausted")
            .with_context("url", &self.config.url)
            .with_context("source", &self.config.name))
    }

    /// One HTTP round trip, classified.
    async fn attempt(&self, query: &[(&str, String)]) -> std::result::Result<String, AttemptFailure> {
        let mut request = self.client.get(&self.config.url).query(query);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(AttemptFailure::Transport)?;
        let status = response.status();

        if status.is_success() {
            return response.text().await.map_err(AttemptFailure::Transport);
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AttemptFailure::Fatal(
                EtlError::authentication(format!("Authentication failed ({})", status.as_u16()))
                    .with_context("status", status.as_u16()),
            )),
            StatusCode::NOT_FOUND => Err(AttemptFailure::Fatal(
                EtlError::not_found("Resource not found").with_context("status", 404),
            )),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| parse_retry_after(v, Utc::now()));
                Err(AttemptFailure::RateLimited { retry_after })
            },
            status if status.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                Err(AttemptFailure::Server { status, body })
            },
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(AttemptFailure::Fatal(
                    EtlError::unexpected(
                        etl_common::ErrorKind::Extraction,
                        format!("Unexpected HTTP status {}", status.as_u16()),
                    )
                    .with_context("status", status.as_u16())
                    .with_context("response_body", truncate(&body)),
                ))
            },
        }
    }

    fn parse_body(&self, body: &str, page: u32) -> Result<Payload> {
        serde_json::from_str(body).map_err(|e| {
            EtlError::malformed_response("Failed to parse JSON response")
                .with_context("url", &self.config.url)
                .with_context("source", &self.config.name)
                .with_context("page", page)
                .with_context("response_body", truncate(body))
                .with_source(e)
        })
    }

    /// Split a page body into its records and the `has_next` flag.
    ///
    /// List bodies carry no flag. Object bodies without `has_next` are the
    /// last page.
    fn split_page(&self, body: Payload, page: u32) -> Result<(Vec<Payload>, Option<bool>)> {
        match body {
            Payload::Array(records) => Ok((records, None)),
            Payload::Object(mut map) => {
                let has_next = map.get("has_next").and_then(Payload::as_bool).unwrap_or(false);
                let records = map.remove("data").or_else(|| map.remove("results"));
                match records {
                    Some(Payload::Array(records)) => Ok((records, Some(has_next))),
                    Some(Payload::Null) => Ok((Vec::new(), Some(false))),
                    _ => Err(self.shape_error(page, "object body without a data or results array")),
                }
            },
            other => Err(self.shape_error(page, &format!("unexpected JSON {}", json_type(&other)))),
        }
    }

    fn shape_error(&self, page: u32, detail: &str) -> EtlError {
        EtlError::malformed_response(format!("Unsupported response shape: {}", detail))
            .with_context("url", &self.config.url)
            .with_context("source", &self.config.name)
            .with_context("page", page)
    }
}

#[async_trait]
impl SourceClient for ApiSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn watermark_type(&self) -> WatermarkType {
        self.config.watermark_type
    }

    async fn fetch(&mut self, watermark: Option<&str>) -> Result<Vec<Payload>> {
        let watermark = watermark.filter(|w| !w.is_empty());
        let mut records = Vec::new();
        let mut pages = 0;

        for page in 1..=self.config.max_pages {
            let body = self.request_page(watermark, page).await?;
            let (batch, has_next) = self.split_page(body, page)?;
            pages = page;

            if batch.is_empty() {
                break;
            }

            let count = batch.len();
            records.extend(batch);
            debug!(source = %self.config.name, page, count, "Fetched page");

            let more = match has_next {
                Some(flag) => flag,
                None => count >= self.config.page_size,
            };
            if !more {
                break;
            }
            if page == self.config.max_pages {
                warn!(
                    source = %self.config.name,
                    max_pages = self.config.max_pages,
                    "Stopped at page limit with more pages advertised"
                );
            }
        }

        info!(
            source = %self.config.name,
            records = records.len(),
            pages,
            "Fetched records from API"
        );

        Ok(records)
    }

    fn external_id(&self, payload: &Payload) -> String {
        field_text(payload, &self.config.id_field).unwrap_or_default()
    }

    fn extract_timestamp(&self, payload: &Payload) -> Option<DateTime<Utc>> {
        field_timestamp(payload, &self.config.timestamp_field)
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_BODY_CHARS).collect()
}

fn json_type(value: &Payload) -> &'static str {
    match value {
        Payload::Null => "null",
        Payload::Bool(_) => "boolean",
        Payload::Number(_) => "number",
        Payload::String(_) => "string",
        Payload::Array(_) => "array",
        Payload::Object(_) => "object",
    }
}
