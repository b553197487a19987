//! Budget gate: per-process action counter and cost snapshot reader.
//!
//! The action counter is process-local and resets on process start. The cost
//! snapshot is a small JSON file maintained by the agent runtime; Guardian
//! only reads it, and tolerates it being absent or malformed (no cost check
//! is better than blocking the agent on someone else's write race).

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::policy::{self, BudgetConfig};

/// Per-process action counter.
///
/// The hook owns one process-wide instance; tests and dry runs construct
/// their own so they never bleed into the real session count.
#[derive(Debug)]
pub struct BudgetTracker {
    count: AtomicU64,
}

impl BudgetTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    /// Increment the counter and return the post-increment value.
    pub fn record_action(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current count without incrementing.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the budget gate for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetState {
    pub action_count: u64,
    pub session_cost_usd: Option<f64>,
    pub exceeded: bool,
    pub reason: Option<String>,
}

/// Cost snapshot file written by the agent runtime.
#[derive(Debug, Deserialize)]
pub struct CostSnapshot {
    #[serde(default)]
    pub session_id: Option<String>,
    pub total_cost_usd: f64,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Read the configured cost file, if any.
///
/// Missing, unreadable, or malformed files yield `None`; the budget gate
/// silently proceeds without a cost figure.
#[must_use]
pub fn read_cost(config: &BudgetConfig, cwd: &Path) -> Option<f64> {
    let cost_file = config.cost_file.as_deref()?;
    let path = policy::resolve_path_value(cost_file, cwd);
    let raw = fs::read_to_string(path).ok()?;
    let snapshot: CostSnapshot = serde_json::from_str(&raw).ok()?;
    Some(snapshot.total_cost_usd)
}

/// Run the budget step for one request.
///
/// The counter increments on every call regardless of `config.enabled`; the
/// checks themselves only run when enabled. The action-count check takes
/// precedence over the cost check.
#[must_use]
pub fn check(tracker: &BudgetTracker, config: &BudgetConfig, cwd: &Path) -> BudgetState {
    let action_count = tracker.record_action();

    if !config.enabled {
        return BudgetState {
            action_count,
            session_cost_usd: None,
            exceeded: false,
            reason: None,
        };
    }

    let max = config.max_actions_per_session;
    if max > 0 && action_count > max {
        return BudgetState {
            action_count,
            session_cost_usd: None,
            exceeded: true,
            reason: Some(format!(
                "action count {action_count} exceeds session limit {max}"
            )),
        };
    }

    let session_cost_usd = read_cost(config, cwd);
    if let (Some(limit), Some(cost)) = (config.session_limit_usd, session_cost_usd) {
        if cost >= limit {
            return BudgetState {
                action_count,
                session_cost_usd,
                exceeded: true,
                reason: Some(format!(
                    "session cost ${cost:.2} reached limit ${limit:.2}"
                )),
            };
        }
    }

    BudgetState {
        action_count,
        session_cost_usd,
        exceeded: false,
        reason: None,
    }
}

/// Remaining dollars under the configured limit, when both figures exist.
#[must_use]
pub fn remaining_usd(config: &BudgetConfig, session_cost_usd: Option<f64>) -> Option<f64> {
    match (config.session_limit_usd, session_cost_usd) {
        (Some(limit), Some(cost)) => Some(limit - cost),
        _ => None,
    }
}
