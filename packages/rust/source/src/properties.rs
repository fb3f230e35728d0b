//! Notion property decoding and record normalization.
//!
//! Every property is decoded on its own. A property that is missing, has an
//! unsupported type, or does not match its declared shape resolves to `None`
//! and never fails the whole record.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;

use catalogsync_shared::{CatalogRecord, FieldNames, RecordId, extract_source_ref};

/// One row as returned by the Notion query endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPage {
    pub id: String,
    #[serde(default)]
    pub last_edited_time: Option<DateTime<Utc>>,
    /// Property values stay untyped until a mapped field asks for them.
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RichText {
    #[serde(default)]
    pub plain_text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectOption {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DateValue {
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
}

/// A typed Notion property value.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotionProperty {
    Title { title: Vec<RichText> },
    RichText { rich_text: Vec<RichText> },
    Select { select: Option<SelectOption> },
    MultiSelect { multi_select: Vec<SelectOption> },
    Number { number: Option<f64> },
    Checkbox { checkbox: bool },
    Date { date: Option<DateValue> },
    Url { url: Option<String> },
    Email { email: Option<String> },
    PhoneNumber { phone_number: Option<String> },
    #[serde(other)]
    Unsupported,
}

impl NotionProperty {
    /// Decode a raw property, or `None` if it is malformed.
    pub fn decode(raw: &Value) -> Option<Self> {
        serde_json::from_value(raw.clone()).ok()
    }

    /// Text rendering of the value. Empty strings count as absent.
    pub fn as_text(&self) -> Option<String> {
        let text = match self {
            Self::Title { title: parts } | Self::RichText { rich_text: parts } => {
                parts.iter().map(|t| t.plain_text.as_str()).collect::<String>()
            }
            Self::Select { select } => select.as_ref()?.name.clone(),
            Self::MultiSelect { multi_select } => multi_select
                .iter()
                .map(|o| o.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            Self::Number { number } => number.as_ref()?.to_string(),
            Self::Checkbox { checkbox } => checkbox.to_string(),
            Self::Date { date } => date.as_ref()?.start.clone(),
            Self::Url { url: v } | Self::Email { email: v } | Self::PhoneNumber { phone_number: v } => {
                v.clone()?
            }
            Self::Unsupported => return None,
        };
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Numeric value. Text properties holding a plain number also qualify.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number { number } => *number,
            Self::Title { .. } | Self::RichText { .. } => self.as_text()?.parse().ok(),
            _ => None,
        }
    }

    /// Calendar date of a `date` property (its start).
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date { date } => parse_date(&date.as_ref()?.start),
            _ => None,
        }
    }
}

/// Parse `2021-05-01` or a full RFC 3339 timestamp into its date part.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

impl RawPage {
    fn property(&self, name: &str) -> Option<NotionProperty> {
        self.properties.get(name).and_then(NotionProperty::decode)
    }

    fn text(&self, name: &str) -> Option<String> {
        self.property(name)?.as_text()
    }
}

/// Normalize one Notion row into a [`CatalogRecord`] (without enrichment).
pub fn parse_record(page: &RawPage, fields: &FieldNames) -> CatalogRecord {
    let external_url = page.text(&fields.video_url);
    let source_ref = external_url.as_deref().and_then(extract_source_ref);

    let play_count = page
        .property(&fields.play_count)
        .and_then(|p| p.as_number())
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n.trunc() as u64)
        .unwrap_or(0);

    CatalogRecord {
        id: RecordId::for_source_ref(source_ref.as_deref()),
        title: page.text(&fields.title).unwrap_or_default(),
        creator_name: page.text(&fields.creator),
        source_ref,
        original_work_name: page.text(&fields.original_work),
        external_url,
        cover_url: None,
        play_count,
        style: page.text(&fields.style),
        era_label: page.text(&fields.era),
        publish_date: page.property(&fields.publish_date).and_then(|p| p.as_date()),
        last_edited_at: page.last_edited_time,
        cover_fetch_attempts: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(properties: Value) -> RawPage {
        serde_json::from_value(json!({
            "id": "page-1",
            "last_edited_time": "2024-03-01T10:00:00.000Z",
            "properties": properties,
        }))
        .expect("raw page")
    }

    #[test]
    fn decodes_each_property_type() {
        let title = json!({"id": "t", "type": "title", "title": [{"plain_text": "Hello "}, {"plain_text": "World"}]});
        assert_eq!(NotionProperty::decode(&title).and_then(|p| p.as_text()), Some("Hello World".into()));

        let select = json!({"type": "select", "select": {"name": "Rock"}});
        assert_eq!(NotionProperty::decode(&select).and_then(|p| p.as_text()), Some("Rock".into()));

        let multi = json!({"type": "multi_select", "multi_select": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(NotionProperty::decode(&multi).and_then(|p| p.as_text()), Some("a, b".into()));

        let number = json!({"type": "number", "number": 1234});
        assert_eq!(NotionProperty::decode(&number).and_then(|p| p.as_number()), Some(1234.0));

        let checkbox = json!({"type": "checkbox", "checkbox": true});
        assert_eq!(NotionProperty::decode(&checkbox).and_then(|p| p.as_text()), Some("true".into()));

        let date = json!({"type": "date", "date": {"start": "2021-05-01T08:00:00.000+08:00", "end": null}});
        assert_eq!(
            NotionProperty::decode(&date).and_then(|p| p.as_date()),
            NaiveDate::from_ymd_opt(2021, 5, 1)
        );

        let url = json!({"type": "url", "url": "https://b23.tv/x"});
        assert_eq!(NotionProperty::decode(&url).and_then(|p| p.as_text()), Some("https://b23.tv/x".into()));
    }

    #[test]
    fn unsupported_and_malformed_properties_are_none() {
        let formula = json!({"type": "formula", "formula": {"string": "x"}});
        let decoded = NotionProperty::decode(&formula).expect("unsupported still decodes");
        assert!(matches!(decoded, NotionProperty::Unsupported));
        assert_eq!(decoded.as_text(), None);

        let malformed = json!({"type": "number", "number": "not a number"});
        assert!(NotionProperty::decode(&malformed).is_none());

        let no_type = json!({"title": []});
        assert!(NotionProperty::decode(&no_type).is_none());
    }

    #[test]
    fn parse_record_maps_default_fields() {
        let raw = page(json!({
            "作品名称": {"type": "title", "title": [{"plain_text": "Song A"}]},
            "全民制作人": {"type": "rich_text", "rich_text": [{"plain_text": "Maker"}]},
            "视频链接": {"type": "url", "url": "https://www.bilibili.com/video/BV1GJ411x7h7"},
            "原曲": {"type": "rich_text", "rich_text": [{"plain_text": "Original"}]},
            "播放量（纯数字）": {"type": "number", "number": 5321},
            "风格": {"type": "select", "select": {"name": "Remix"}},
            "创作时代": {"type": "select", "select": null},
            "发布时间": {"type": "date", "date": {"start": "2020-01-02"}}
        }));
        let record = parse_record(&raw, &FieldNames::default());

        assert_eq!(record.title, "Song A");
        assert_eq!(record.creator_name.as_deref(), Some("Maker"));
        assert_eq!(record.source_ref.as_deref(), Some("BV1GJ411x7h7"));
        assert_eq!(record.id, RecordId::Stable(32735454));
        assert_eq!(record.original_work_name.as_deref(), Some("Original"));
        assert_eq!(record.play_count, 5321);
        assert_eq!(record.style.as_deref(), Some("Remix"));
        assert_eq!(record.era_label, None);
        assert_eq!(record.publish_date, NaiveDate::from_ymd_opt(2020, 1, 2));
        assert!(record.last_edited_at.is_some());
        assert_eq!(record.cover_url, None);
        assert_eq!(record.cover_fetch_attempts, 0);
    }

    #[test]
    fn parse_record_without_video_is_unidentified() {
        let raw = page(json!({
            "作品名称": {"type": "title", "title": [{"plain_text": "Loose"}]},
            "播放量（纯数字）": {"type": "rich_text", "rich_text": [{"plain_text": "oops"}]}
        }));
        let record = parse_record(&raw, &FieldNames::default());
        assert_eq!(record.source_ref, None);
        assert!(!record.id.is_stable());
        assert_eq!(record.play_count, 0);
        assert_eq!(record.external_url, None);
    }
}
