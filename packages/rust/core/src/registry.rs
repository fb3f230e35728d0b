//! In-memory registry of sync runs.
//!
//! The registry is an explicit object handed to whoever runs or polls syncs.
//! It admits one active run at a time and drops finished runs once they are
//! older than the retention window.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use catalogsync_shared::{CatalogSyncError, Result};

use crate::progress::{Phase, SyncObserver, SyncRun, SyncStats};

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, SyncRun>,
    active: Option<Uuid>,
}

/// Tracks sync runs for pollers.
pub struct RunRegistry {
    inner: Mutex<Inner>,
    retention: Duration,
}

impl RunRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new pending run, or fail if another run is still active.
    pub fn begin<'a>(&'a self, observer: &'a dyn SyncObserver) -> Result<RunTracker<'a>> {
        let snapshot = {
            let mut inner = self.lock();
            purge_locked(&mut inner, self.retention);

            if let Some(active) = inner.active {
                let still_running = inner
                    .runs
                    .get(&active)
                    .is_some_and(|run| !run.status.is_terminal());
                if still_running {
                    return Err(CatalogSyncError::SyncInProgress {
                        run_id: active.to_string(),
                    });
                }
            }

            let run = SyncRun::new();
            inner.active = Some(run.id);
            inner.runs.insert(run.id, run.clone());
            run
        };

        debug!(run_id = %snapshot.id, "registered sync run");
        observer.on_update(&snapshot);

        Ok(RunTracker {
            registry: self,
            observer,
            id: snapshot.id,
        })
    }

    /// Latest snapshot of a run, if it has not been purged.
    pub fn snapshot(&self, id: Uuid) -> Option<SyncRun> {
        self.lock().runs.get(&id).cloned()
    }

    /// The run currently holding the active slot.
    pub fn active(&self) -> Option<SyncRun> {
        let inner = self.lock();
        inner
            .active
            .and_then(|id| inner.runs.get(&id))
            .filter(|run| !run.status.is_terminal())
            .cloned()
    }

    /// Number of runs currently retained.
    pub fn len(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop terminal runs older than the retention window.
    pub fn purge_expired(&self) -> usize {
        purge_locked(&mut self.lock(), self.retention)
    }

    fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut SyncRun) -> Result<T>) -> Result<(T, SyncRun)> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| CatalogSyncError::validation(format!("unknown run {id}")))?;
        let value = f(run)?;
        let snapshot = run.clone();
        if snapshot.status.is_terminal() && inner.active == Some(id) {
            inner.active = None;
        }
        Ok((value, snapshot))
    }
}

fn purge_locked(inner: &mut Inner, retention: Duration) -> usize {
    let now = Utc::now();
    let before = inner.runs.len();
    inner.runs.retain(|_, run| {
        let expired = run.status.is_terminal()
            && run
                .finished_at
                .and_then(|finished| (now - finished).to_std().ok())
                .is_some_and(|age| age > retention);
        !expired
    });
    let purged = before - inner.runs.len();
    if purged > 0 {
        debug!(purged, "purged expired sync runs");
    }
    purged
}

// ---------------------------------------------------------------------------
// RunTracker
// ---------------------------------------------------------------------------

/// Write handle for one run. Every change is pushed to the observer.
///
/// Dropping a tracker whose run has not finished marks it failed, so a
/// cancelled sync never keeps the active slot.
pub struct RunTracker<'a> {
    registry: &'a RunRegistry,
    observer: &'a dyn SyncObserver,
    id: Uuid,
}

impl RunTracker<'_> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn apply<T>(&self, f: impl FnOnce(&mut SyncRun) -> Result<T>) -> Result<T> {
        let (value, snapshot) = self.registry.update(self.id, f)?;
        self.observer.on_update(&snapshot);
        Ok(value)
    }

    pub fn start(&self) -> Result<()> {
        self.apply(SyncRun::start)
    }

    pub fn advance(&self, phase: Phase, fraction: f64) -> Result<()> {
        self.apply(|run| run.advance(phase, fraction))
    }

    pub fn record(&self, f: impl FnOnce(&mut SyncStats)) -> Result<()> {
        self.apply(|run| {
            f(&mut run.stats);
            run.truncated = run.stats.fetch_truncated || run.stats.enrichment_truncated;
            Ok(())
        })
    }

    pub fn complete(&self) -> Result<SyncRun> {
        self.apply(|run| {
            run.complete()?;
            Ok(run.clone())
        })
    }

    pub fn fail(&self, message: impl Into<String>) -> Result<()> {
        self.apply(|run| run.fail(message))
    }
}

impl Drop for RunTracker<'_> {
    fn drop(&mut self) {
        let unfinished = self
            .registry
            .snapshot(self.id)
            .is_some_and(|run| !run.status.is_terminal());
        if unfinished {
            warn!(run_id = %self.id, "sync run dropped before finishing");
            let _ = self.fail("run aborted before completion");
        }
    }
}
