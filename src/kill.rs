//! Kill switch: converting qualifying denials into session termination.
//!
//! The controller is consulted only after the denial's audit entry has been
//! appended (or auditing is disabled); a kill must never outrun its record.

use crate::pipeline::{Source, ValidationResult};
use crate::policy::{BreachAction, Policy, Severity};

/// Decide whether a recorded denial terminates the session.
#[must_use]
pub fn should_kill(policy: &Policy, result: &ValidationResult) -> bool {
    let switch = &policy.kill_switch;
    if !switch.enabled || result.allowed {
        return false;
    }

    if switch.on_blocklist_critical
        && result.source == Some(Source::Blocklist)
        && result.severity == Some(Severity::Critical)
    {
        return true;
    }

    if switch.on_budget_breach
        && result.source == Some(Source::Budget)
        && policy.budget.action_on_breach == BreachAction::Kill
    {
        return true;
    }

    false
}

/// Terminate the process with the configured exit code.
///
/// Writes a single diagnostic line to stderr first.
pub fn kill(policy: &Policy, reason: &str) -> ! {
    eprintln!("guardian: session terminated: {reason}");
    std::process::exit(policy.kill_switch.exit_code)
}
