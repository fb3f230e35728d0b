//! End-to-end sync: load baseline → fetch → merge → enrich covers → persist.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use catalogsync_covers::{BilibiliClient, CoverLookup};
use catalogsync_shared::{Result, SyncBaseline, SyncSettings};
use catalogsync_source::{FetchOptions, FetchProgress, NotionClient, SourceApi, fetch_sources};
use catalogsync_storage::BaselineStore;

use crate::enrichment::{self, EnrichmentPolicy, EnrichmentProgress};
use crate::merge::{self, MergePolicy, SyncMode};
use crate::progress::{Phase, SyncObserver, SyncStats};
use crate::registry::{RunRegistry, RunTracker};

/// Fetch progress never reports a full phase until fetching has ended.
const FETCH_ESTIMATE_CAP: f64 = 0.95;

/// Per-run overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub mode: SyncMode,
    /// Replaces the configured time budget for this run.
    pub time_budget: Option<Duration>,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub stats: SyncStats,
    pub truncated: bool,
    pub elapsed: Duration,
    /// The merged baseline, also when persisting it failed.
    pub baseline: SyncBaseline,
}

/// Wires a record source, a cover lookup and a baseline store together.
pub struct Synchronizer {
    source: Box<dyn SourceApi>,
    covers: Box<dyn CoverLookup>,
    store: Box<dyn BaselineStore>,
    settings: SyncSettings,
}

impl Synchronizer {
    pub fn new(
        source: Box<dyn SourceApi>,
        covers: Box<dyn CoverLookup>,
        store: Box<dyn BaselineStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            source,
            covers,
            store,
            settings,
        }
    }

    /// Build the Notion and Bilibili clients from resolved settings.
    pub fn from_settings(settings: SyncSettings, store: Box<dyn BaselineStore>) -> Result<Self> {
        let source = NotionClient::new(&settings.notion)?;
        let covers = BilibiliClient::new(&settings.covers)?;
        Ok(Self::new(Box::new(source), Box::new(covers), store, settings))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run one sync under the registry's single-run rule.
    ///
    /// Hitting the time budget is not an error: the run completes with
    /// `truncated` set. Failing to persist is not an error either; it is
    /// reported through `stats.persisted`.
    #[instrument(skip_all, fields(store = self.store.name(), mode = ?options.mode))]
    pub async fn run(
        &self,
        registry: &RunRegistry,
        observer: &dyn SyncObserver,
        options: SyncOptions,
    ) -> Result<SyncReport> {
        let start = Instant::now();
        let budget = options.time_budget.unwrap_or(self.settings.time_budget);
        let deadline = start + budget;

        let tracker = registry.begin(observer)?;
        tracker.start()?;
        info!(run_id = %tracker.id(), budget_secs = budget.as_secs_f64(), "starting sync");

        let baseline = match self.execute(&tracker, options.mode, deadline).await {
            Ok(baseline) => baseline,
            Err(e) => {
                warn!(run_id = %tracker.id(), error = %e, "sync failed");
                if let Err(fail_err) = tracker.fail(e.to_string()) {
                    debug!(error = %fail_err, "could not mark run failed");
                }
                return Err(e);
            }
        };

        let run = tracker.complete()?;
        let elapsed = start.elapsed();
        info!(
            run_id = %run.id,
            elapsed_ms = elapsed.as_millis() as u64,
            truncated = run.truncated,
            "sync complete"
        );

        Ok(SyncReport {
            run_id: run.id,
            stats: run.stats,
            truncated: run.truncated,
            elapsed,
            baseline,
        })
    }

    async fn execute(
        &self,
        tracker: &RunTracker<'_>,
        mode: SyncMode,
        deadline: Instant,
    ) -> Result<SyncBaseline> {
        // --- Phase 1: Load baseline ---
        let (baseline, baseline_loaded) =
            match tokio::time::timeout_at(deadline, self.store.load()).await {
                Ok(Ok(baseline)) => (baseline, true),
                Ok(Err(e)) => {
                    warn!(error = %e, "baseline load failed, starting from an empty baseline");
                    (SyncBaseline::default(), false)
                }
                Err(_) => {
                    warn!(
                        store = self.store.name(),
                        "baseline load ran past the deadline, starting from an empty baseline"
                    );
                    (SyncBaseline::default(), false)
                }
            };
        debug!(records = baseline.len(), last_sync = ?baseline.last_sync, "baseline loaded");

        // --- Phase 2: Fetch ---
        tracker.advance(Phase::Fetch, 0.0)?;
        let fetch_progress = FetchPhase {
            tracker,
            expected: baseline.len(),
        };
        let fetched = fetch_sources(
            self.source.as_ref(),
            &self.settings.notion.database_ids,
            &self.settings.notion.fields,
            &FetchOptions::from(&self.settings.notion),
            deadline,
            &fetch_progress,
        )
        .await?;
        let (total_fetched, pages, fetch_truncated) =
            (fetched.records.len(), fetched.pages, fetched.truncated);
        tracker.record(|s| {
            s.total_fetched = total_fetched;
            s.pages = pages;
            s.fetch_truncated = fetch_truncated;
        })?;
        tracker.advance(Phase::Fetch, 1.0)?;

        // --- Phase 3: Merge ---
        let policy = MergePolicy {
            edit_tolerance: self.settings.edit_tolerance,
            max_attempts: self.settings.covers.max_attempts,
        };
        let outcome = merge::merge(fetched.records, &baseline, &policy, mode);
        let touched = outcome.new_records.len() + outcome.changed_records.len();
        let skipped = touched.saturating_sub(outcome.work.len());
        tracker.record(|s| {
            s.new_records = outcome.new_records.len();
            s.changed_records = outcome.changed_records.len();
            s.unchanged_records = outcome.unchanged.len();
            s.unidentified_records = outcome.unidentified();
            s.cover_skipped = skipped;
        })?;
        tracker.advance(Phase::Merge, 1.0)?;

        let mut merged = outcome.baseline;

        // --- Phase 4: Enrich covers ---
        if self.settings.covers.enabled {
            let mut work = outcome.work;
            if self.settings.covers.backfill {
                let backfill = merge::backfill_candidates(&merged, &work, &policy);
                if !backfill.is_empty() {
                    info!(backfill = backfill.len(), "queueing cover backfill");
                }
                work.extend(backfill);
            }

            let report = enrichment::enrich(
                &mut merged.records,
                &work,
                self.covers.as_ref(),
                &EnrichmentPolicy::from(&self.settings.covers),
                deadline,
                &EnrichPhase { tracker },
            )
            .await;
            tracker.record(|s| {
                s.cover_successes = report.successes;
                s.cover_failures = report.failures;
                s.cover_pending = report.pending;
                s.enrichment_truncated = report.truncated;
            })?;
        } else {
            info!(work = outcome.work.len(), "cover lookup disabled, skipping enrichment");
        }
        tracker.advance(Phase::Enrich, 1.0)?;

        // --- Phase 5: Persist ---
        // A partial fetch over an unknown baseline would overwrite the stored
        // records with a fraction of them.
        if !baseline_loaded && fetch_truncated {
            warn!(
                store = self.store.name(),
                "baseline was not loaded and fetch was truncated, skipping save"
            );
            tracker.record(|s| {
                s.persisted = false;
                s.persist_error = Some("save skipped: baseline not loaded and fetch truncated".into());
            })?;
            tracker.advance(Phase::Persist, 1.0)?;
            return Ok(merged);
        }

        merged.last_sync = Some(Utc::now());
        match self.store.save(&merged).await {
            Ok(()) => tracker.record(|s| s.persisted = true)?,
            Err(e) => {
                warn!(store = self.store.name(), error = %e, "baseline save failed, keeping merged result in memory");
                let message = e.to_string();
                tracker.record(|s| {
                    s.persisted = false;
                    s.persist_error = Some(message);
                })?;
            }
        }
        tracker.advance(Phase::Persist, 1.0)?;

        Ok(merged)
    }
}

// ---------------------------------------------------------------------------
// Phase progress adapters
// ---------------------------------------------------------------------------

struct FetchPhase<'a> {
    tracker: &'a RunTracker<'a>,
    /// Baseline size, used as the estimate of the upstream total.
    expected: usize,
}

impl FetchProgress for FetchPhase<'_> {
    fn page_fetched(&self, _pages: usize, records: usize) {
        let fraction = (records as f64 / self.expected.max(1) as f64).min(FETCH_ESTIMATE_CAP);
        if let Err(e) = self.tracker.advance(Phase::Fetch, fraction) {
            debug!(error = %e, "fetch progress update rejected");
        }
    }
}

struct EnrichPhase<'a> {
    tracker: &'a RunTracker<'a>,
}

impl EnrichmentProgress for EnrichPhase<'_> {
    fn item_done(&self, done: usize, total: usize) {
        let fraction = done as f64 / total.max(1) as f64;
        if let Err(e) = self.tracker.advance(Phase::Enrich, fraction) {
            debug!(error = %e, "enrichment progress update rejected");
        }
    }
}
