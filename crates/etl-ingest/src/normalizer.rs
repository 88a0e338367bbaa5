//! Raw payload to unified item mapping
//!
//! Each source kind has an alias table; the first alias holding a non-blank
//! value wins. Keys no alias claims are kept verbatim in `metadata`.
//! Coercion failures become absent values. Only the checks in
//! [`validate`] reject a record.

use chrono::{DateTime, Utc};
use etl_common::watermark::parse_timestamp;
use etl_common::{EtlError, Result};
use serde_json::Map;

use crate::models::{ItemStatus, NormalizedItem, Payload, RawRecord, SourceKind};

/// Longest accepted external id
pub const MAX_EXTERNAL_ID_LEN: usize = 255;

/// Longest accepted title
pub const MAX_TITLE_LEN: usize = 500;

/// Longest accepted category
pub const MAX_CATEGORY_LEN: usize = 200;

/// Longest accepted author
pub const MAX_AUTHOR_LEN: usize = 200;

/// Longest accepted url or image url
pub const MAX_URL_LEN: usize = 2048;

/// Highest accepted rating
pub const MAX_RATING: f64 = 5.0;

/// Where each unified field is read from for one source kind
struct FieldMap {
    external_id: &'static [&'static str],
    title: &'static [&'static str],
    description: &'static [&'static str],
    category: &'static [&'static str],
    url: &'static [&'static str],
    image_url: &'static [&'static str],
    author: &'static [&'static str],
    amount: &'static [&'static str],
    quantity: &'static [&'static str],
    rating: &'static [&'static str],
    tags: &'static [&'static str],
    published: &'static [&'static str],
}

impl FieldMap {
    fn claims(&self, key: &str) -> bool {
        [
            self.external_id,
            self.title,
            self.description,
            self.category,
            self.url,
            self.image_url,
            self.author,
            self.amount,
            self.quantity,
            self.rating,
            self.tags,
            self.published,
        ]
        .iter()
        .any(|aliases| aliases.contains(&key))
    }
}

const API_FIELDS: FieldMap = FieldMap {
    external_id: &["id", "item_id"],
    title: &["name", "title"],
    description: &["description"],
    category: &["category"],
    url: &["url"],
    image_url: &["image_url", "thumbnail"],
    author: &["author"],
    amount: &["price", "cost"],
    quantity: &["quantity", "stock"],
    rating: &["rating"],
    tags: &["tags"],
    published: &["created_date", "created_at"],
};

const FILE_FIELDS: FieldMap = FieldMap {
    external_id: &["id", "row_id"],
    title: &["product_name", "name", "title"],
    description: &["details", "description"],
    category: &["category"],
    url: &["url", "link"],
    image_url: &[],
    author: &[],
    amount: &["cost", "price"],
    quantity: &["quantity", "qty"],
    rating: &[],
    tags: &["keywords", "tags"],
    published: &["date", "created_at"],
};

const FEED_FIELDS: FieldMap = FieldMap {
    external_id: &["id", "guid"],
    title: &["title"],
    description: &["summary", "description"],
    category: &["category"],
    url: &["link"],
    image_url: &[],
    author: &["author"],
    amount: &[],
    quantity: &[],
    rating: &[],
    tags: &["tags", "categories"],
    published: &["published"],
};

fn field_map(kind: SourceKind) -> &'static FieldMap {
    match kind {
        SourceKind::Api => &API_FIELDS,
        SourceKind::File => &FILE_FIELDS,
        SourceKind::Feed => &FEED_FIELDS,
    }
}

/// Normalize a stored raw record.
///
/// The source-native id captured at extraction wins over the alias table, so
/// a source keyed by a custom id field keeps that key.
pub fn normalize_record(record: &RawRecord) -> Result<NormalizedItem> {
    normalize(
        &record.payload,
        record.source_kind,
        &record.source_name,
        record.id,
        record.source_id.as_deref(),
    )
}

/// Map one payload into a validated unified item.
pub fn normalize(
    payload: &Payload,
    kind: SourceKind,
    source_name: &str,
    raw_record_id: i64,
    source_id: Option<&str>,
) -> Result<NormalizedItem> {
    let fields = field_map(kind);
    let object = payload.as_object().ok_or_else(|| {
        EtlError::validation("Payload is not an object").with_context("raw_record_id", raw_record_id)
    })?;

    let external_id = source_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| first_text(object, fields.external_id))
        .unwrap_or_default();

    let status_field = object.get("status").and_then(Payload::as_str);
    let status = status_field.and_then(|s| s.parse::<ItemStatus>().ok());

    let mut metadata: Map<String, Payload> = object
        .iter()
        .filter(|(key, _)| !fields.claims(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if status.is_some() {
        metadata.remove("status");
    }

    let item = NormalizedItem {
        source_kind: kind,
        source_name: source_name.to_string(),
        external_id,
        raw_record_id,
        title: first_text(object, fields.title).unwrap_or_default(),
        description: first_text(object, fields.description),
        category: first_text(object, fields.category),
        url: first_text(object, fields.url),
        image_url: first_text(object, fields.image_url),
        author: first_text(object, fields.author),
        amount: first_present(object, fields.amount).and_then(parse_float),
        quantity: first_present(object, fields.quantity).and_then(parse_int),
        rating: first_present(object, fields.rating).and_then(parse_float),
        tags: first_present(object, fields.tags).map(parse_tags).unwrap_or_default(),
        metadata,
        status: status.unwrap_or_default(),
        published_at: first_present(object, fields.published).and_then(parse_datetime),
    };

    validate(&item)?;
    Ok(item)
}

/// Reject items that cannot be stored.
pub fn validate(item: &NormalizedItem) -> Result<()> {
    let fail = |field: &str, message: String| {
        Err(EtlError::validation(message)
            .with_context("raw_record_id", item.raw_record_id)
            .with_context("field", field))
    };

    if item.title.is_empty() {
        return fail("title", "Title is required".to_string());
    }
    if item.title.chars().count() > MAX_TITLE_LEN {
        return fail("title", format!("Title exceeds {} characters", MAX_TITLE_LEN));
    }
    if item.external_id.is_empty() {
        return fail("external_id", "External id is required".to_string());
    }
    if item.external_id.chars().count() > MAX_EXTERNAL_ID_LEN {
        return fail(
            "external_id",
            format!("External id exceeds {} characters", MAX_EXTERNAL_ID_LEN),
        );
    }
    let too_long = |value: &Option<String>, max: usize| {
        value.as_ref().is_some_and(|v| v.chars().count() > max)
    };
    if too_long(&item.category, MAX_CATEGORY_LEN) {
        return fail("category", format!("Category exceeds {} characters", MAX_CATEGORY_LEN));
    }
    if too_long(&item.author, MAX_AUTHOR_LEN) {
        return fail("author", format!("Author exceeds {} characters", MAX_AUTHOR_LEN));
    }
    if too_long(&item.url, MAX_URL_LEN) {
        return fail("url", format!("Url exceeds {} characters", MAX_URL_LEN));
    }
    if too_long(&item.image_url, MAX_URL_LEN) {
        return fail("image_url", format!("Image url exceeds {} characters", MAX_URL_LEN));
    }
    if let Some(amount) = item.amount.filter(|a| *a < 0.0) {
        return fail("amount", format!("Amount cannot be negative: {}", amount));
    }
    if let Some(quantity) = item.quantity.filter(|q| *q < 0) {
        return fail("quantity", format!("Quantity cannot be negative: {}", quantity));
    }
    if let Some(rating) = item.rating.filter(|r| !(0.0..=MAX_RATING).contains(r)) {
        return fail("rating", format!("Rating must be between 0 and {}: {}", MAX_RATING, rating));
    }

    Ok(())
}

/// First alias holding a non-null value.
fn first_present<'a>(object: &'a Map<String, Payload>, aliases: &[&str]) -> Option<&'a Payload> {
    aliases
        .iter()
        .filter_map(|alias| object.get(*alias))
        .find(|value| !value.is_null() && !is_blank(value))
}

/// First alias holding non-blank scalar text, trimmed.
fn first_text(object: &Map<String, Payload>, aliases: &[&str]) -> Option<String> {
    aliases.iter().filter_map(|alias| object.get(*alias)).find_map(text)
}

fn is_blank(value: &Payload) -> bool {
    value.as_str().is_some_and(|s| s.trim().is_empty())
}

fn text(value: &Payload) -> Option<String> {
    let rendered = match value {
        Payload::String(s) => s.trim().to_string(),
        Payload::Number(n) => n.to_string(),
        Payload::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!rendered.is_empty()).then_some(rendered)
}

pub fn parse_float(value: &Payload) -> Option<f64> {
    let parsed = match value {
        Payload::Number(n) => n.as_f64(),
        Payload::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// Integers go through floats so `"10.0"` becomes 10.
pub fn parse_int(value: &Payload) -> Option<i64> {
    if let Some(int) = value.as_i64() {
        return Some(int);
    }
    parse_float(value)
        .filter(|f| *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
        .map(|f| f.trunc() as i64)
}

/// Lists or comma-separated strings; blank entries are dropped.
pub fn parse_tags(value: &Payload) -> Vec<String> {
    match value {
        Payload::Array(items) => items.iter().filter_map(text).collect(),
        Payload::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_datetime(value: &Payload) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_timestamp)
}
