//! Core domain types for the catalog.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound for [`CatalogRecord::cover_fetch_attempts`].
pub const MAX_COVER_ATTEMPTS: u8 = 3;

/// Bilibili video ids embedded in a video URL (`BV` + 10 alphanumerics).
static SOURCE_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"BV[0-9A-Za-z]{10}").expect("valid BV regex"));

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// Identity of a catalog record.
///
/// `Stable` ids are derived from the record's `source_ref` and survive across
/// syncs. Records without a `source_ref` get an `Unidentified` id that is
/// random per parse: they cannot be deduplicated or matched against a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Stable(i64),
    Unidentified(Uuid),
}

impl RecordId {
    /// Derive the id for a record with the given source reference.
    pub fn for_source_ref(source_ref: Option<&str>) -> Self {
        match source_ref {
            Some(r) => Self::Stable(stable_hash(r)),
            None => Self::Unidentified(Uuid::new_v4()),
        }
    }

    /// The numeric id, if this record has a stable identity.
    pub fn stable(&self) -> Option<i64> {
        match self {
            Self::Stable(id) => Some(*id),
            Self::Unidentified(_) => None,
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Stable(_))
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable(id) => write!(f, "{id}"),
            Self::Unidentified(uuid) => write!(f, "unidentified-{uuid}"),
        }
    }
}

/// 32-bit `h = h * 31 + unit` string hash over UTF-16 code units, made
/// non-negative. Matches the ids already stored in the remote cache.
pub fn stable_hash(s: &str) -> i64 {
    let mut hash: i32 = 0;
    for unit in s.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    i64::from(hash).abs()
}

/// Extract the Bilibili video id from a video URL.
pub fn extract_source_ref(url: &str) -> Option<String> {
    SOURCE_REF_RE.find(url).map(|m| m.as_str().to_string())
}

// ---------------------------------------------------------------------------
// CatalogRecord
// ---------------------------------------------------------------------------

/// One catalog entry, normalized from an upstream database row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: RecordId,
    pub title: String,
    #[serde(default)]
    pub creator_name: Option<String>,
    /// External reference used for matching and cover lookup (a BV id).
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub original_work_name: Option<String>,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub play_count: u64,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub era_label: Option<String>,
    #[serde(default)]
    pub publish_date: Option<NaiveDate>,
    /// Upstream edit timestamp, used for change detection.
    #[serde(default)]
    pub last_edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cover_fetch_attempts: u8,
}

impl CatalogRecord {
    /// A record with only a title and (optional) source reference set.
    pub fn new(title: impl Into<String>, source_ref: Option<String>) -> Self {
        Self {
            id: RecordId::for_source_ref(source_ref.as_deref()),
            title: title.into(),
            creator_name: None,
            source_ref,
            original_work_name: None,
            external_url: None,
            cover_url: None,
            play_count: 0,
            style: None,
            era_label: None,
            publish_date: None,
            last_edited_at: None,
            cover_fetch_attempts: 0,
        }
    }

    /// Whether the cover lookup budget is used up.
    pub fn cover_attempts_exhausted(&self) -> bool {
        self.cover_fetch_attempts >= MAX_COVER_ATTEMPTS
    }
}

// ---------------------------------------------------------------------------
// SyncBaseline
// ---------------------------------------------------------------------------

/// The last reconciled, persisted set of catalog records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncBaseline {
    #[serde(default)]
    pub records: Vec<CatalogRecord>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncBaseline {
    pub fn new(records: Vec<CatalogRecord>) -> Self {
        Self {
            records,
            last_sync: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position of each record by `source_ref`. Later duplicates win.
    pub fn index_by_source_ref(&self) -> HashMap<&str, usize> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.source_ref.as_deref().map(|s| (s, i)))
            .collect()
    }

    pub fn find(&self, source_ref: &str) -> Option<&CatalogRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.source_ref.as_deref() == Some(source_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_matches_stored_ids() {
        assert_eq!(stable_hash(""), 0);
        assert_eq!(stable_hash("a"), 97);
        assert_eq!(stable_hash("BV001"), 63562077);
        assert_eq!(stable_hash("BV1GJ411x7h7"), 32735454);
        assert_eq!(stable_hash("BV1xx411c7mD"), 160580418);
    }

    #[test]
    fn record_id_is_deterministic_for_source_ref() {
        let a = RecordId::for_source_ref(Some("BV1GJ411x7h7"));
        let b = RecordId::for_source_ref(Some("BV1GJ411x7h7"));
        assert_eq!(a, b);
        assert_eq!(a.stable(), Some(32735454));
    }

    #[test]
    fn record_id_without_source_ref_is_unidentified() {
        let a = RecordId::for_source_ref(None);
        let b = RecordId::for_source_ref(None);
        assert!(!a.is_stable());
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("unidentified-"));
    }

    #[test]
    fn record_id_untagged_serde() {
        let stable: RecordId = serde_json::from_str("42").expect("stable id");
        assert_eq!(stable, RecordId::Stable(42));

        let uuid = Uuid::now_v7();
        let json = serde_json::to_string(&RecordId::Unidentified(uuid)).expect("serialize");
        let parsed: RecordId = serde_json::from_str(&json).expect("unidentified id");
        assert_eq!(parsed, RecordId::Unidentified(uuid));
    }

    #[test]
    fn extracts_bv_from_url() {
        assert_eq!(
            extract_source_ref("https://www.bilibili.com/video/BV1GJ411x7h7/?p=1"),
            Some("BV1GJ411x7h7".into())
        );
        assert_eq!(extract_source_ref("https://example.com/watch?v=abc"), None);
        assert_eq!(extract_source_ref("BV123"), None);
    }

    #[test]
    fn baseline_index_prefers_later_duplicates() {
        let baseline = SyncBaseline::new(vec![
            CatalogRecord::new("first", Some("BV1GJ411x7h7".into())),
            CatalogRecord::new("no ref", None),
            CatalogRecord::new("second", Some("BV1GJ411x7h7".into())),
        ]);
        let index = baseline.index_by_source_ref();
        assert_eq!(index.len(), 1);
        assert_eq!(index["BV1GJ411x7h7"], 2);
        assert_eq!(baseline.find("BV1GJ411x7h7").map(|r| r.title.as_str()), Some("second"));
    }

    #[test]
    fn record_serialization_roundtrip() {
        let mut record = CatalogRecord::new("Song", Some("BV1xx411c7mD".into()));
        record.publish_date = NaiveDate::from_ymd_opt(2021, 5, 1);
        record.cover_fetch_attempts = 2;
        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: CatalogRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, record);
    }
}
