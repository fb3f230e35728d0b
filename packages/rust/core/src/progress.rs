//! Sync run state, phase-weighted progress and observers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use catalogsync_shared::{CatalogSyncError, Result};

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Pipeline phase of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetch,
    Merge,
    Enrich,
    Persist,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Fetch, Phase::Merge, Phase::Enrich, Phase::Persist];

    /// Share of the overall progress bar, in percent. Sums to 100.
    pub fn weight(self) -> f64 {
        match self {
            Self::Fetch => 75.0,
            Self::Merge => 5.0,
            Self::Enrich => 15.0,
            Self::Persist => 5.0,
        }
    }

    /// Progress value at the start of this phase.
    fn offset(self) -> f64 {
        Self::ALL
            .iter()
            .take_while(|p| **p != self)
            .map(|p| p.weight())
            .sum()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Merge => "merge",
            Self::Enrich => "enrich",
            Self::Persist => "persist",
        }
    }
}

/// Overall progress (0-100) for `fraction` of `phase` done.
pub fn overall_progress(phase: Phase, fraction: f64) -> u8 {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    (phase.offset() + phase.weight() * fraction).floor().min(100.0) as u8
}

// ---------------------------------------------------------------------------
// SyncRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Aggregate counters of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub total_fetched: usize,
    pub pages: usize,
    pub new_records: usize,
    pub changed_records: usize,
    pub unchanged_records: usize,
    pub unidentified_records: usize,
    pub cover_successes: usize,
    pub cover_failures: usize,
    /// New or changed records that needed no lookup.
    pub cover_skipped: usize,
    /// Lookups left unprocessed when the deadline hit.
    pub cover_pending: usize,
    pub fetch_truncated: bool,
    pub enrichment_truncated: bool,
    pub persisted: bool,
    pub persist_error: Option<String>,
}

/// Snapshot of a sync run as seen by pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub phase: Option<Phase>,
    pub progress: u8,
    pub stats: SyncStats,
    pub truncated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl SyncRun {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            status: RunStatus::Pending,
            phase: None,
            progress: 0,
            stats: SyncStats::default(),
            truncated: false,
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
        }
    }

    fn invalid(&self, action: &str) -> CatalogSyncError {
        CatalogSyncError::validation(format!(
            "cannot {action} run {} in state {:?}",
            self.id, self.status
        ))
    }

    /// `pending -> running`, progress reset to 0.
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.status != RunStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.status = RunStatus::Running;
        self.progress = 0;
        self.started_at = Utc::now();
        Ok(())
    }

    /// Move progress forward. Never decreases.
    pub(crate) fn advance(&mut self, phase: Phase, fraction: f64) -> Result<()> {
        if self.status != RunStatus::Running {
            return Err(self.invalid("advance"));
        }
        self.phase = Some(phase);
        self.progress = self.progress.max(overall_progress(phase, fraction));
        Ok(())
    }

    /// `running -> completed`, progress forced to 100.
    pub(crate) fn complete(&mut self) -> Result<()> {
        if self.status != RunStatus::Running {
            return Err(self.invalid("complete"));
        }
        self.status = RunStatus::Completed;
        self.progress = 100;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// `pending|running -> failed`. Progress keeps its last value.
    pub(crate) fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("fail"));
        }
        self.status = RunStatus::Failed;
        self.error_message = Some(message.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Receives every snapshot update of a run.
pub trait SyncObserver: Send + Sync {
    fn on_update(&self, run: &SyncRun);
}

/// Observer that ignores updates.
pub struct SilentObserver;

impl SyncObserver for SilentObserver {
    fn on_update(&self, _run: &SyncRun) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_weights_sum_to_100() {
        let total: f64 = Phase::ALL.iter().map(|p| p.weight()).sum();
        assert_eq!(total, 100.0);
        assert_eq!(overall_progress(Phase::Fetch, 0.0), 0);
        assert_eq!(overall_progress(Phase::Fetch, 1.0), 75);
        assert_eq!(overall_progress(Phase::Merge, 1.0), 80);
        assert_eq!(overall_progress(Phase::Enrich, 0.5), 87);
        assert_eq!(overall_progress(Phase::Persist, 1.0), 100);
        assert_eq!(overall_progress(Phase::Enrich, f64::NAN), 80);
    }

    #[test]
    fn progress_is_monotonic() {
        let mut run = SyncRun::new();
        run.start().expect("start");
        run.advance(Phase::Enrich, 0.5).expect("advance");
        let high = run.progress;
        run.advance(Phase::Fetch, 0.1).expect("advance");
        assert_eq!(run.progress, high);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut run = SyncRun::new();
        assert!(run.advance(Phase::Fetch, 0.5).is_err());
        assert!(run.complete().is_err());

        run.start().expect("start");
        assert!(run.start().is_err());
        run.advance(Phase::Merge, 1.0).expect("advance");
        run.complete().expect("complete");
        assert_eq!(run.progress, 100);
        assert!(run.finished_at.is_some());
        assert!(run.fail("late").is_err());
    }

    #[test]
    fn failure_keeps_progress() {
        let mut run = SyncRun::new();
        run.start().expect("start");
        run.advance(Phase::Fetch, 0.4).expect("advance");
        run.fail("unauthorized").expect("fail");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.progress, 30);
        assert_eq!(run.error_message.as_deref(), Some("unauthorized"));
    }
}
