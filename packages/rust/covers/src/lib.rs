//! Cover image lookup.
//!
//! A lookup never fails with an error. Every response is classified into a
//! [`LookupOutcome`] so the caller can apply one retry policy to all of them.

mod bilibili;

use async_trait::async_trait;

pub use bilibili::BilibiliClient;

// ---------------------------------------------------------------------------
// LookupOutcome
// ---------------------------------------------------------------------------

/// Result of a single cover lookup call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The item has a cover at this URL.
    Success(String),
    /// Rate limited, server error or connection failure. May succeed later.
    Retryable(String),
    /// Confirmed absent (deleted, not found, no cover). Retrying will not help.
    Terminal(String),
    /// The per-call timeout elapsed.
    Timeout,
}

/// Looks up a cover image URL for a source reference.
#[async_trait]
pub trait CoverLookup: Send + Sync {
    async fn lookup(&self, source_ref: &str) -> LookupOutcome;
}
