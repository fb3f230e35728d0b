//! Change detection and merge of fetched records into the baseline.
//!
//! Matching is by `source_ref` only. Records without one are always new and
//! are never matched, so repeated syncs accumulate copies of them.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use catalogsync_shared::{CatalogRecord, MAX_COVER_ATTEMPTS, RecordId, SyncBaseline};

/// How fetched records are compared against the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Only new and changed records are enriched.
    #[default]
    Incremental,
    /// Every fetched record is treated as new and every cover is refetched.
    Full,
}

/// Tolerances for change detection.
#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    /// `last_edited_at` drift up to and including this is noise.
    pub edit_tolerance: Duration,
    pub max_attempts: u8,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            edit_tolerance: Duration::from_secs(3_600),
            max_attempts: MAX_COVER_ATTEMPTS,
        }
    }
}

/// What to do about a record's cover after a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverDecision {
    /// Leave cover and attempt counter as they are.
    Keep,
    /// Look up again, continuing the existing attempt counter.
    Retry,
    /// Look up again from a fresh attempt counter.
    Refetch,
}

impl CoverDecision {
    pub fn needs_lookup(self) -> bool {
        !matches!(self, Self::Keep)
    }
}

/// Result of merging one fetch into a baseline.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Baseline records plus new ones, with changed records overwritten.
    pub baseline: SyncBaseline,
    pub unchanged: Vec<RecordId>,
    pub new_records: Vec<RecordId>,
    pub changed_records: Vec<RecordId>,
    /// Source refs that need a cover lookup, in fetch order.
    pub work: Vec<String>,
}

impl MergeOutcome {
    pub fn unidentified(&self) -> usize {
        self.new_records.iter().filter(|id| !id.is_stable()).count()
    }
}

/// Whether two edit timestamps differ by strictly more than `tolerance`.
/// Missing timestamps never count as an edit.
pub fn edited_beyond(
    prev: Option<DateTime<Utc>>,
    next: Option<DateTime<Utc>>,
    tolerance: Duration,
) -> bool {
    match (prev, next) {
        (Some(a), Some(b)) => {
            u128::from((b - a).num_milliseconds().unsigned_abs()) > tolerance.as_millis()
        }
        _ => false,
    }
}

/// Whether `next` differs from `prev` in a field that matters.
///
/// `cover_url` only counts when the fetched record carries one: records
/// fresh from upstream never do. A baseline entry without an edit time is
/// replaced as soon as upstream supplies one, otherwise later edits could
/// never be measured against it.
pub fn is_changed(prev: &CatalogRecord, next: &CatalogRecord, policy: &MergePolicy) -> bool {
    prev.title != next.title
        || prev.external_url != next.external_url
        || (next.cover_url.is_some() && next.cover_url != prev.cover_url)
        || (prev.last_edited_at.is_none() && next.last_edited_at.is_some())
        || edited_beyond(prev.last_edited_at, next.last_edited_at, policy.edit_tolerance)
}

/// Decide whether `next` needs a cover lookup given its baseline entry.
pub fn needs_cover(
    prev: Option<&CatalogRecord>,
    next: &CatalogRecord,
    policy: &MergePolicy,
) -> CoverDecision {
    if next.source_ref.is_none() {
        return CoverDecision::Keep;
    }
    let Some(prev) = prev else {
        return CoverDecision::Refetch;
    };
    if prev.source_ref != next.source_ref
        || edited_beyond(prev.last_edited_at, next.last_edited_at, policy.edit_tolerance)
    {
        return CoverDecision::Refetch;
    }
    if prev.cover_url.is_some() || prev.cover_fetch_attempts >= policy.max_attempts {
        return CoverDecision::Keep;
    }
    CoverDecision::Retry
}

/// Last-seen record wins for repeated `source_ref`s, at the first position.
fn dedup_fetched(fetched: Vec<CatalogRecord>) -> Vec<CatalogRecord> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<CatalogRecord> = Vec::with_capacity(fetched.len());
    for record in fetched {
        let existing = record
            .source_ref
            .as_ref()
            .and_then(|r| positions.get(r).copied());
        match existing {
            Some(i) => out[i] = record,
            None => {
                if let Some(r) = &record.source_ref {
                    positions.insert(r.clone(), out.len());
                }
                out.push(record);
            }
        }
    }
    out
}

/// Merge a fetch into `baseline`.
///
/// Baseline records missing from the fetch are kept: a truncated fetch must
/// not drop data. Each record is replaced in one assignment.
pub fn merge(
    fetched: Vec<CatalogRecord>,
    baseline: &SyncBaseline,
    policy: &MergePolicy,
    mode: SyncMode,
) -> MergeOutcome {
    let fetched = dedup_fetched(fetched);

    let mut records = baseline.records.clone();
    let mut index: HashMap<String, usize> = baseline
        .index_by_source_ref()
        .into_iter()
        .map(|(r, i)| (r.to_string(), i))
        .collect();

    let mut outcome = MergeOutcome::default();
    let mut queued: HashSet<String> = HashSet::new();

    for mut next in fetched {
        let Some(source_ref) = next.source_ref.clone() else {
            outcome.new_records.push(next.id);
            records.push(next);
            continue;
        };

        match index.get(&source_ref).copied() {
            None => {
                outcome.new_records.push(next.id);
                index.insert(source_ref.clone(), records.len());
                records.push(next);
                queued.insert(source_ref.clone());
                outcome.work.push(source_ref);
            }
            Some(i) if mode == SyncMode::Full => {
                let prev = &records[i];
                next.cover_url = next.cover_url.or_else(|| prev.cover_url.clone());
                next.cover_fetch_attempts = 0;
                outcome.new_records.push(next.id);
                records[i] = next;
                if queued.insert(source_ref.clone()) {
                    outcome.work.push(source_ref);
                }
            }
            Some(i) => {
                let prev = &records[i];
                if !is_changed(prev, &next, policy) {
                    outcome.unchanged.push(prev.id);
                    continue;
                }

                let decision = needs_cover(Some(prev), &next, policy);
                next.cover_url = next.cover_url.or_else(|| prev.cover_url.clone());
                next.cover_fetch_attempts = match decision {
                    CoverDecision::Refetch => 0,
                    _ => prev.cover_fetch_attempts,
                };
                debug!(%source_ref, ?decision, "record changed");

                outcome.changed_records.push(next.id);
                records[i] = next;
                if decision.needs_lookup() && queued.insert(source_ref.clone()) {
                    outcome.work.push(source_ref);
                }
            }
        }
    }

    info!(
        new = outcome.new_records.len(),
        changed = outcome.changed_records.len(),
        unchanged = outcome.unchanged.len(),
        work = outcome.work.len(),
        "merge complete"
    );

    outcome.baseline = SyncBaseline {
        records,
        last_sync: baseline.last_sync,
    };
    outcome
}

/// Records outside `work` that still lack a cover and have attempts left.
pub fn backfill_candidates(
    baseline: &SyncBaseline,
    work: &[String],
    policy: &MergePolicy,
) -> Vec<String> {
    let mut seen: HashSet<&str> = work.iter().map(String::as_str).collect();
    baseline
        .records
        .iter()
        .filter(|r| r.cover_url.is_none() && r.cover_fetch_attempts < policy.max_attempts)
        .filter_map(|r| r.source_ref.as_deref())
        .filter(|r| seen.insert(*r))
        .map(String::from)
        .collect()
}
