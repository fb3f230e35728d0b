//! Cover enrichment: retry driver and bounded lookup window.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::{Instant, timeout_at};
use tracing::{info, instrument, warn};

use catalogsync_covers::{CoverLookup, LookupOutcome};
use catalogsync_shared::{CatalogRecord, CoverSettings, MAX_COVER_ATTEMPTS};

// ---------------------------------------------------------------------------
// Policy & resolution
// ---------------------------------------------------------------------------

/// Limits for the enrichment phase.
#[derive(Debug, Clone, Copy)]
pub struct EnrichmentPolicy {
    /// Lookups in flight at once.
    pub concurrency: usize,
    pub max_attempts: u8,
    /// First retry delay, doubled on each further retry.
    pub backoff: Duration,
}

impl Default for EnrichmentPolicy {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: MAX_COVER_ATTEMPTS,
            backoff: Duration::from_millis(200),
        }
    }
}

impl From<&CoverSettings> for EnrichmentPolicy {
    fn from(settings: &CoverSettings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            max_attempts: settings.max_attempts,
            backoff: settings.backoff,
        }
    }
}

/// Final state of one item after the retry driver is done with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverResolution {
    Found(String),
    /// Confirmed absent upstream.
    Absent(String),
    /// Transient failures used up the attempt budget.
    GaveUp(String),
    /// The per-call timeout elapsed. No retry within this run.
    TimedOut,
}

impl CoverResolution {
    /// Write the resolution into `record` in one step.
    pub fn apply(&self, record: &mut CatalogRecord, max_attempts: u8) {
        match self {
            Self::Found(url) => {
                record.cover_url = Some(url.clone());
                record.cover_fetch_attempts = 0;
            }
            Self::Absent(_) | Self::GaveUp(_) => {
                record.cover_url = None;
                record.cover_fetch_attempts = max_attempts;
            }
            Self::TimedOut => {
                record.cover_fetch_attempts = record
                    .cover_fetch_attempts
                    .saturating_add(1)
                    .min(max_attempts);
            }
        }
    }
}

/// Drive lookups for one item until it resolves.
///
/// Retryable failures are retried with exponential backoff within the
/// budget left (`max_attempts - prior_attempts`, at least one call).
pub async fn resolve_cover(
    lookup: &dyn CoverLookup,
    source_ref: &str,
    prior_attempts: u8,
    policy: &EnrichmentPolicy,
) -> CoverResolution {
    let budget = policy.max_attempts.saturating_sub(prior_attempts).max(1);
    let mut attempt: u8 = 0;

    loop {
        attempt += 1;
        match lookup.lookup(source_ref).await {
            LookupOutcome::Success(url) => return CoverResolution::Found(url),
            LookupOutcome::Terminal(reason) => return CoverResolution::Absent(reason),
            LookupOutcome::Timeout => return CoverResolution::TimedOut,
            LookupOutcome::Retryable(reason) if attempt >= budget => {
                return CoverResolution::GaveUp(reason);
            }
            LookupOutcome::Retryable(reason) => {
                let delay = policy.backoff * 2u32.pow(u32::from(attempt - 1));
                warn!(source_ref, attempt, %reason, delay_ms = delay.as_millis() as u64, "cover lookup failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Callback interface for enrichment progress.
pub trait EnrichmentProgress: Send + Sync {
    fn item_done(&self, done: usize, total: usize);
}

/// No-op progress sink.
pub struct SilentEnrichment;

impl EnrichmentProgress for SilentEnrichment {
    fn item_done(&self, _done: usize, _total: usize) {}
}

/// Counters for one enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub attempted: usize,
    pub successes: usize,
    pub failures: usize,
    pub timeouts: usize,
    /// Items never resolved because the deadline hit.
    pub pending: usize,
    pub truncated: bool,
}

/// Look up covers for `work` and write results into `records`.
///
/// At most `policy.concurrency` lookups run at once; each completion admits
/// the next queued item. Results are matched to records by `source_ref`, so
/// completion order does not matter. When `deadline` passes, in-flight
/// lookups are dropped and their records are left as they were.
#[instrument(skip_all, fields(items = work.len(), concurrency = policy.concurrency))]
pub async fn enrich(
    records: &mut [CatalogRecord],
    work: &[String],
    lookup: &dyn CoverLookup,
    policy: &EnrichmentPolicy,
    deadline: Instant,
    progress: &dyn EnrichmentProgress,
) -> EnrichmentReport {
    let index: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.source_ref.clone().map(|s| (s, i)))
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let items: Vec<(String, u8)> = work
        .iter()
        .filter(|r| seen.insert(r.as_str()))
        .filter_map(|r| index.get(r).map(|&i| (r.clone(), records[i].cover_fetch_attempts)))
        .collect();

    let total = items.len();
    let mut report = EnrichmentReport {
        attempted: total,
        ..EnrichmentReport::default()
    };
    if total == 0 {
        return report;
    }
    if Instant::now() >= deadline {
        warn!(pending = total, "time budget already spent, skipping enrichment");
        report.pending = total;
        report.truncated = true;
        return report;
    }

    let mut results = stream::iter(items)
        .map(|(source_ref, prior)| async move {
            let resolution = resolve_cover(lookup, &source_ref, prior, policy).await;
            (source_ref, resolution)
        })
        .buffer_unordered(policy.concurrency.max(1));

    let mut done = 0usize;
    loop {
        let (source_ref, resolution) = match timeout_at(deadline, results.next()).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => {
                report.truncated = true;
                break;
            }
        };

        match &resolution {
            CoverResolution::Found(url) => {
                report.successes += 1;
                info!(%source_ref, cover = %url, "cover found");
            }
            CoverResolution::Absent(reason) => {
                report.failures += 1;
                warn!(%source_ref, %reason, "cover not available");
            }
            CoverResolution::GaveUp(reason) => {
                report.failures += 1;
                warn!(%source_ref, %reason, "cover lookup gave up after retries");
            }
            CoverResolution::TimedOut => {
                report.failures += 1;
                report.timeouts += 1;
                warn!(%source_ref, "cover lookup timed out");
            }
        }

        if let Some(&i) = index.get(&source_ref) {
            resolution.apply(&mut records[i], policy.max_attempts);
        }

        done += 1;
        progress.item_done(done, total);
    }

    report.pending = total - done;
    if report.truncated {
        warn!(pending = report.pending, "time budget reached, enrichment stopped");
    }
    info!(
        successes = report.successes,
        failures = report.failures,
        pending = report.pending,
        "enrichment finished"
    );
    report
}
