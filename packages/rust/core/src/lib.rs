//! Sync orchestration and reconciliation logic for catalogsync.
//!
//! This crate ties the record source, cover lookup and baseline store
//! together into one incremental sync run:
//! - [`merge`]: change detection and merge into the baseline
//! - [`enrichment`]: bounded, deadline-aware cover lookups with retries
//! - [`progress`] / [`registry`]: run state, weighted progress, single-run rule
//! - [`sync`]: the end-to-end [`Synchronizer`]

pub mod enrichment;
pub mod merge;
pub mod progress;
pub mod registry;
pub mod sync;

pub use enrichment::{
    CoverResolution, EnrichmentPolicy, EnrichmentProgress, EnrichmentReport, SilentEnrichment,
    enrich, resolve_cover,
};
pub use merge::{CoverDecision, MergeOutcome, MergePolicy, SyncMode, backfill_candidates, merge};
pub use progress::{Phase, RunStatus, SilentObserver, SyncObserver, SyncRun, SyncStats};
pub use registry::{RunRegistry, RunTracker};
pub use sync::{SyncOptions, SyncReport, Synchronizer};
