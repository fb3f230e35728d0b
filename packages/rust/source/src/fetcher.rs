//! Paged fetcher: walks a source in cursor order under a deadline.

use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};

use catalogsync_shared::{CatalogRecord, FieldNames, NotionSettings, Result};

use crate::client::SourceApi;
use crate::properties::parse_record;

/// Receives a marker after every fetched page.
pub trait FetchProgress: Send + Sync {
    /// `pages` and `records` are running totals for the whole fetch.
    fn page_fetched(&self, pages: usize, records: usize);
}

/// No-op progress sink.
pub struct SilentFetch;

impl FetchProgress for SilentFetch {
    fn page_fetched(&self, _pages: usize, _records: usize) {}
}

/// Pacing knobs for a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Pause between page requests.
    pub page_delay: Duration,
    /// Stop after this many pages per source.
    pub max_pages: Option<u32>,
}

impl From<&NotionSettings> for FetchOptions {
    fn from(settings: &NotionSettings) -> Self {
        Self {
            page_delay: settings.page_delay,
            max_pages: settings.max_pages,
        }
    }
}

/// Records collected by a fetch, in upstream cursor order.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<CatalogRecord>,
    pub pages: usize,
    /// The fetch stopped before the source was exhausted.
    pub truncated: bool,
}

/// Fetch every page of `source_id`.
///
/// Reaching `deadline` is not an error: whatever was collected is returned
/// with `truncated = true`. A failed page after at least one good page is
/// treated the same way. Only a failure before any page arrived, or an auth
/// rejection, is returned as an error.
pub async fn fetch_all(
    api: &dyn SourceApi,
    source_id: &str,
    fields: &FieldNames,
    options: &FetchOptions,
    deadline: Instant,
    progress: &dyn FetchProgress,
) -> Result<FetchOutcome> {
    let ids = [source_id.to_string()];
    fetch_sources(api, &ids, fields, options, deadline, progress).await
}

/// Fetch several sources one after another and concatenate their records.
#[instrument(skip_all, fields(sources = source_ids.len()))]
pub async fn fetch_sources(
    api: &dyn SourceApi,
    source_ids: &[String],
    fields: &FieldNames,
    options: &FetchOptions,
    deadline: Instant,
    progress: &dyn FetchProgress,
) -> Result<FetchOutcome> {
    let mut outcome = FetchOutcome::default();

    'sources: for source_id in source_ids {
        let mut cursor: Option<String> = None;
        let mut source_pages: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                warn!(%source_id, pages = outcome.pages, "time budget reached, stopping fetch");
                outcome.truncated = true;
                break 'sources;
            }

            let page = match timeout_at(deadline, api.query_page(source_id, cursor.as_deref())).await
            {
                Err(_) => {
                    warn!(%source_id, pages = outcome.pages, "time budget reached mid-request, stopping fetch");
                    outcome.truncated = true;
                    break 'sources;
                }
                Ok(Err(e)) if e.is_fatal() => return Err(e),
                Ok(Err(e)) if outcome.pages == 0 => return Err(e),
                Ok(Err(e)) => {
                    warn!(%source_id, pages = outcome.pages, error = %e, "page fetch failed, keeping partial result");
                    outcome.truncated = true;
                    break 'sources;
                }
                Ok(Ok(page)) => page,
            };

            source_pages += 1;
            outcome.pages += 1;
            outcome
                .records
                .extend(page.results.iter().map(|raw| parse_record(raw, fields)));
            progress.page_fetched(outcome.pages, outcome.records.len());

            debug!(
                %source_id,
                page = source_pages,
                records = page.results.len(),
                has_more = page.has_more,
                "fetched page"
            );

            match page.next_cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }

            if options.max_pages.is_some_and(|max| source_pages >= max) {
                info!(%source_id, max_pages = source_pages, "page cap reached");
                break;
            }

            if !options.page_delay.is_zero() {
                tokio::time::sleep(options.page_delay).await;
            }
        }
    }

    info!(
        records = outcome.records.len(),
        pages = outcome.pages,
        truncated = outcome.truncated,
        "fetch finished"
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use catalogsync_shared::CatalogSyncError;
    use serde_json::json;

    use crate::client::SourcePage;
    use crate::properties::RawPage;

    /// Scripted upstream: `pages[source]` is served in order, cursor = index.
    struct ScriptedSource {
        pages: HashMap<String, Vec<Result<SourcePage>>>,
        delay_on: Option<(String, usize, Duration)>,
        calls: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                delay_on: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_pages(mut self, source: &str, pages: Vec<Result<SourcePage>>) -> Self {
            self.pages.insert(source.into(), pages);
            self
        }
    }

    #[async_trait]
    impl SourceApi for ScriptedSource {
        async fn query_page(&self, source_id: &str, cursor: Option<&str>) -> Result<SourcePage> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((source_id.into(), cursor.map(String::from)));
            let index: usize = cursor.map_or(0, |c| c.parse().expect("numeric cursor"));
            if let Some((source, at, delay)) = &self.delay_on {
                if source == source_id && *at == index {
                    tokio::time::sleep(*delay).await;
                }
            }
            match &self.pages[source_id][index] {
                Ok(page) => Ok(page.clone()),
                Err(e) => Err(CatalogSyncError::Network(e.to_string())),
            }
        }
    }

    fn page_of(bvs: &[&str], next: Option<usize>) -> Result<SourcePage> {
        let results = bvs
            .iter()
            .map(|bv| {
                serde_json::from_value::<RawPage>(json!({
                    "id": format!("page-{bv}"),
                    "properties": {
                        "作品名称": {"type": "title", "title": [{"plain_text": format!("title {bv}")}]},
                        "视频链接": {"type": "url", "url": format!("https://www.bilibili.com/video/{bv}")}
                    }
                }))
                .expect("raw page")
            })
            .collect();
        Ok(SourcePage {
            results,
            has_more: next.is_some(),
            next_cursor: next.map(|n| n.to_string()),
        })
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    struct RecordingProgress(Mutex<Vec<(usize, usize)>>);

    impl FetchProgress for RecordingProgress {
        fn page_fetched(&self, pages: usize, records: usize) {
            self.0.lock().expect("progress lock").push((pages, records));
        }
    }

    #[tokio::test]
    async fn pages_in_cursor_order_until_exhausted() {
        let api = ScriptedSource::new().with_pages(
            "db",
            vec![
                page_of(&["BV1aaaaaaaaa", "BV1bbbbbbbbb"], Some(1)),
                page_of(&["BV1ccccccccc"], Some(2)),
                page_of(&["BV1ddddddddd"], None),
            ],
        );
        let progress = RecordingProgress(Mutex::new(Vec::new()));

        let outcome = fetch_all(
            &api,
            "db",
            &FieldNames::default(),
            &FetchOptions::default(),
            far_deadline(),
            &progress,
        )
        .await
        .expect("fetch");

        assert_eq!(outcome.pages, 3);
        assert!(!outcome.truncated);
        let refs: Vec<_> = outcome
            .records
            .iter()
            .filter_map(|r| r.source_ref.as_deref())
            .collect();
        assert_eq!(refs, ["BV1aaaaaaaaa", "BV1bbbbbbbbb", "BV1ccccccccc", "BV1ddddddddd"]);
        assert_eq!(
            *progress.0.lock().expect("progress lock"),
            vec![(1, 2), (2, 3), (3, 4)]
        );
    }

    #[tokio::test]
    async fn deadline_after_second_page_truncates_without_error() {
        let mut api = ScriptedSource::new().with_pages(
            "db",
            vec![
                page_of(&["BV1aaaaaaaaa"], Some(1)),
                page_of(&["BV1bbbbbbbbb"], Some(2)),
                page_of(&["BV1ccccccccc"], None),
            ],
        );
        api.delay_on = Some(("db".into(), 2, Duration::from_secs(10)));

        let deadline = Instant::now() + Duration::from_millis(300);
        let outcome = fetch_all(
            &api,
            "db",
            &FieldNames::default(),
            &FetchOptions::default(),
            deadline,
            &SilentFetch,
        )
        .await
        .expect("truncation is not an error");

        assert!(outcome.truncated);
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.records.len(), 2);
    }

    #[tokio::test]
    async fn expired_deadline_returns_empty_truncated() {
        let api = ScriptedSource::new().with_pages("db", vec![page_of(&["BV1aaaaaaaaa"], None)]);
        let outcome = fetch_all(
            &api,
            "db",
            &FieldNames::default(),
            &FetchOptions::default(),
            Instant::now(),
            &SilentFetch,
        )
        .await
        .expect("fetch");
        assert!(outcome.truncated);
        assert!(outcome.records.is_empty());
        assert!(api.calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn first_page_failure_is_an_error() {
        let api = ScriptedSource::new().with_pages(
            "db",
            vec![Err(CatalogSyncError::Network("connection refused".into()))],
        );
        let err = fetch_all(
            &api,
            "db",
            &FieldNames::default(),
            &FetchOptions::default(),
            far_deadline(),
            &SilentFetch,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CatalogSyncError::Network(_)));
    }

    #[tokio::test]
    async fn later_page_failure_keeps_partial_result() {
        let api = ScriptedSource::new().with_pages(
            "db",
            vec![
                page_of(&["BV1aaaaaaaaa"], Some(1)),
                Err(CatalogSyncError::Network("502".into())),
            ],
        );
        let outcome = fetch_all(
            &api,
            "db",
            &FieldNames::default(),
            &FetchOptions::default(),
            far_deadline(),
            &SilentFetch,
        )
        .await
        .expect("partial fetch");
        assert!(outcome.truncated);
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn multiple_sources_concatenate_and_respect_page_cap() {
        let api = ScriptedSource::new()
            .with_pages(
                "one",
                vec![
                    page_of(&["BV1aaaaaaaaa"], Some(1)),
                    page_of(&["BV1bbbbbbbbb"], None),
                ],
            )
            .with_pages("two", vec![page_of(&["BV1ccccccccc"], None)]);
        let options = FetchOptions {
            page_delay: Duration::from_millis(1),
            max_pages: Some(1),
        };

        let outcome = fetch_sources(
            &api,
            &["one".to_string(), "two".to_string()],
            &FieldNames::default(),
            &options,
            far_deadline(),
            &SilentFetch,
        )
        .await
        .expect("fetch");

        assert_eq!(outcome.pages, 2);
        assert!(!outcome.truncated);
        let refs: Vec<_> = outcome
            .records
            .iter()
            .filter_map(|r| r.source_ref.as_deref())
            .collect();
        assert_eq!(refs, ["BV1aaaaaaaaa", "BV1ccccccccc"]);
    }
}
