//! Result-count strategies.
//!
//! All strategies share one counting primitive; they only differ in the
//! number of granted hits after which pending-count scanning stops.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How much extra scanning to pay for a better total estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountStrategy {
    /// Stop as soon as one more page is known to exist.
    More,
    /// Look ahead a bounded window past the current page.
    Window,
    /// Count up to the global result cap.
    #[default]
    Limited,
}

impl CountStrategy {
    /// Configuration key.
    pub fn name(&self) -> &'static str {
        match self {
            CountStrategy::More => "am_more",
            CountStrategy::Window => "am_window",
            CountStrategy::Limited => "am_limited",
        }
    }

    /// Parse a configuration value, falling back to `Limited` for anything
    /// unrecognized so broad queries always stay bounded.
    pub fn from_config(value: &str) -> Self {
        value.parse().unwrap_or_else(|e: String| {
            tracing::warn!(value, error = %e, "unknown search strategy, using am_limited");
            CountStrategy::Limited
        })
    }

    /// Number of granted hits at which pending-count scanning stops.
    pub fn target(&self, offset: u64, limit: u64, thresholds: &CountThresholds) -> u64 {
        match self {
            CountStrategy::More => offset
                .saturating_add(limit)
                .saturating_add(thresholds.more_extra),
            CountStrategy::Window => {
                offset.saturating_add(limit.saturating_mul(thresholds.window_factor))
            }
            CountStrategy::Limited => thresholds.max_search_results,
        }
    }
}

impl fmt::Display for CountStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CountStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "am_more" | "more" => Ok(CountStrategy::More),
            "am_window" | "window" => Ok(CountStrategy::Window),
            // Index-side security filtering is not available; the legacy
            // mode counts like LIMITED.
            "am_limited" | "limited" | "lucene" => Ok(CountStrategy::Limited),
            other => Err(format!(
                "unknown strategy '{}'; expected lucene, am_more, am_window or am_limited",
                other
            )),
        }
    }
}

/// Stopping thresholds for pending-count scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountThresholds {
    /// MORE scans to `offset + limit + more_extra`.
    pub more_extra: u64,
    /// WINDOW scans to `offset + limit * window_factor`.
    pub window_factor: u64,
    /// LIMITED scans to this many granted hits.
    pub max_search_results: u64,
}

impl Default for CountThresholds {
    fn default() -> Self {
        Self {
            more_extra: 1,
            window_factor: 2,
            max_search_results: 1000,
        }
    }
}
