//! Upstream record source: Notion client, property decoding, paged fetcher.
//!
//! This crate provides:
//! - [`SourceApi`] / [`NotionClient`]: one page of a database query
//! - [`properties`]: typed property decoding into [`CatalogRecord`](catalogsync_shared::CatalogRecord)
//! - [`fetch_all`] / [`fetch_sources`]: cursor paging under a deadline

pub mod client;
pub mod fetcher;
pub mod properties;

pub use client::{NotionClient, SourceApi, SourcePage};
pub use fetcher::{FetchOptions, FetchOutcome, FetchProgress, SilentFetch, fetch_all, fetch_sources};
pub use properties::{NotionProperty, RawPage, parse_record};

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_shared::FieldNames;

    fn load_fixture(name: &str) -> SourcePage {
        let path = format!("../../../fixtures/notion/{name}");
        let content = std::fs::read_to_string(&path)
            .unwrap_or_else(|_| panic!("missing fixture: {path}"));
        serde_json::from_str(&content).expect("fixture is a query response")
    }

    #[test]
    fn fixture_page_parses_into_records() {
        let page = load_fixture("database_query.json");
        assert!(page.has_more);
        assert_eq!(page.next_cursor.as_deref(), Some("cursor-page-2"));

        let records: Vec<_> = page
            .results
            .iter()
            .map(|raw| parse_record(raw, &FieldNames::default()))
            .collect();
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].title, "青花瓷 (Remix)");
        assert_eq!(records[0].source_ref.as_deref(), Some("BV1GJ411x7h7"));
        assert_eq!(records[0].play_count, 10234);
        assert_eq!(records[0].style.as_deref(), Some("电子"));

        assert_eq!(records[1].source_ref.as_deref(), Some("BV1xx411c7mD"));
        assert_eq!(records[1].creator_name, None);

        // Third row has no video link and a formula column.
        assert_eq!(records[2].source_ref, None);
        assert!(!records[2].id.is_stable());
        assert_eq!(records[2].play_count, 0);
    }
}
