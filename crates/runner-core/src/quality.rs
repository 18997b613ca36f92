use std::collections::HashMap;

use crate::authority::Authority;

/// Base number of unprocessable records tolerated before any were saved.
const UNPROCESSABLE_FLOOR: u64 = 5;

/// Raised when an authority produces more unprocessable records than its
/// error budget allows; terminates that authority's task only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "too many unprocessable records for {authority}: \
     {unprocessed} unprocessable against {saved} saved"
)]
pub struct UnprocessableSite {
    /// The offending authority.
    pub authority: Authority,
    /// Records saved so far for this authority.
    pub saved: u64,
    /// Unprocessable records seen so far for this authority.
    pub unprocessed: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct AuthorityStats {
    saved: u64,
    unprocessed: u64,
}

/// Per-authority error-budget tracking for one run.
///
/// Owned by the run that created it, never a process-wide singleton, so
/// concurrent runs and tests cannot contaminate each other's counts.
#[derive(Debug, Default)]
pub struct DataQualityMonitor {
    stats: HashMap<Authority, AuthorityStats>,
}

impl DataQualityMonitor {
    /// Creates a monitor with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one successfully saved record for `authority`.
    pub fn record_saved(&mut self, authority: &Authority) {
        self.stats.entry(authority.clone()).or_default().saved += 1;
    }

    /// Counts one unprocessable record for `authority`.
    ///
    /// Returns [`UnprocessableSite`] once the count exceeds
    /// `5 + 0.1 × saved`; the caller is expected to propagate it and let
    /// the authority's task abort.
    pub fn record_unprocessable(&mut self, authority: &Authority) -> Result<(), UnprocessableSite> {
        let stats = self.stats.entry(authority.clone()).or_default();
        stats.unprocessed += 1;

        let budget = UNPROCESSABLE_FLOOR as f64 + 0.1 * stats.saved as f64;
        if stats.unprocessed as f64 > budget {
            return Err(UnprocessableSite {
                authority: authority.clone(),
                saved: stats.saved,
                unprocessed: stats.unprocessed,
            });
        }
        Ok(())
    }

    /// `(saved, unprocessable)` counts for one authority.
    pub fn counts(&self, authority: &Authority) -> (u64, u64) {
        self.stats
            .get(authority)
            .map(|s| (s.saved, s.unprocessed))
            .unwrap_or((0, 0))
    }

    /// `(saved, unprocessable)` totals across all authorities.
    pub fn totals(&self) -> (u64, u64) {
        self.stats.values().fold((0, 0), |(saved, bad), s| {
            (saved + s.saved, bad + s.unprocessed)
        })
    }
}
