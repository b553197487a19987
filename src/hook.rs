//! The pre-tool-use hook protocol.
//!
//! One JSON request on stdin, one JSON decision on stdout. The adapter is
//! deliberately **fail-open**: Guardian faulting must not strand the agent,
//! because the audit trail and kill switch remain observable out-of-band.
//! Anything that goes wrong internally — unreadable stdin, unparseable JSON,
//! a missing or broken policy, an audit write failure — degrades to an allow
//! with a note on stderr.

use serde::{Deserialize, Serialize};
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;

use crate::audit::{self, BudgetSnapshot, EntryDraft};
use crate::budget::{self, BudgetTracker};
use crate::kill;
use crate::pipeline::{self, ValidationResult};
use crate::policy;

/// Process-wide action counter shared by every request the process handles.
pub static BUDGET: BudgetTracker = BudgetTracker::new();

/// Input structure of the pre-tool-use hook request.
#[derive(Debug, Clone, Deserialize)]
pub struct HookInput {
    /// The tool being invoked ("Bash", "Read", ..., or an `mcp__` extension).
    pub tool_name: String,

    /// Tool-specific parameters.
    #[serde(default)]
    pub tool_input: serde_json::Map<String, serde_json::Value>,

    /// Session identifier, echoed into audit entries.
    #[serde(default)]
    pub session_id: Option<String>,

    /// Working directory override; defaults to the process cwd.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Decision object written to stdout.
#[derive(Debug, Serialize)]
pub struct HookOutput {
    #[serde(rename = "permissionDecision")]
    pub permission_decision: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(rename = "systemMessage", skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

impl HookOutput {
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            permission_decision: "allow",
            reason: None,
            system_message: None,
        }
    }

    #[must_use]
    pub fn from_result(result: &ValidationResult) -> Self {
        if result.is_denied() {
            return Self {
                permission_decision: "deny",
                reason: result.reason.as_ref().map(|r| format!("[Guardian] {r}")),
                system_message: None,
            };
        }
        let mut output = Self::allow();
        if result.is_coerced_violation() {
            output.system_message = result
                .reason
                .as_ref()
                .map(|r| format!("[Guardian] audit mode: {r}"));
        }
        output
    }
}

/// Disable colored output when stderr is not a terminal.
pub fn configure_colors() {
    if !io::stderr().is_terminal() {
        colored::control::set_override(false);
    }
}

fn emit(output: &HookOutput) {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let _ = serde_json::to_writer(&mut handle, output);
    let _ = writeln!(handle);
    let _ = handle.flush();
}

fn emit_allow() -> i32 {
    emit(&HookOutput::allow());
    0
}

/// Read one request from stdin, decide, record, and answer.
///
/// Returns the process exit code; a kill-switch termination exits directly
/// and never returns.
pub fn run() -> i32 {
    let mut raw = String::with_capacity(256);
    if io::stdin().read_to_string(&mut raw).is_err() {
        eprintln!("guardian: failed to read stdin; allowing");
        return emit_allow();
    }

    if raw.trim().is_empty() {
        return emit_allow();
    }

    // Fail-open on unparseable input, with no audit side effect.
    let input: HookInput = match serde_json::from_str(&raw) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("guardian: unparseable hook input ({e}); allowing");
            return emit_allow();
        }
    };

    let cwd = input
        .cwd
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let compiled = match policy::load(&cwd) {
        Ok(compiled) => compiled,
        Err(e) => {
            eprintln!("guardian: {e}; allowing");
            return emit_allow();
        }
    };
    let policy = &compiled.policy;

    let result = pipeline::evaluate(&input, &compiled, &cwd, &BUDGET);

    // Record before answering; a kill must come after its audit entry.
    let mut audit_recorded = false;
    if policy.audit.enabled {
        let snapshot = if policy.budget.enabled {
            let cost = budget::read_cost(&policy.budget, &cwd);
            Some(BudgetSnapshot {
                remaining_usd: budget::remaining_usd(&policy.budget, cost),
                action_count: BUDGET.current(),
            })
        } else {
            None
        };

        let draft = EntryDraft {
            sid: input.session_id.clone(),
            tool: input.tool_name.clone(),
            input: policy
                .audit
                .include_tool_input
                .then(|| serde_json::Value::Object(input.tool_input.clone())),
            allowed: result.allowed,
            reason: result.reason.clone(),
            severity: result.severity,
            policy_match: result.pattern.clone(),
            budget: snapshot,
            cwd: cwd.to_string_lossy().into_owned(),
        };

        let mut writer = audit::WRITER
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match writer.append(&cwd, &policy.audit, draft) {
            Ok(_) => audit_recorded = true,
            Err(e) => eprintln!("guardian: audit write failed: {e}"),
        }
    }

    emit(&HookOutput::from_result(&result));

    if result.is_denied() && kill::should_kill(policy, &result) {
        // Never terminate a session whose violation failed to be recorded.
        if !policy.audit.enabled || audit_recorded {
            let reason = result.reason.as_deref().unwrap_or("policy violation");
            kill::kill(policy, reason);
        }
        eprintln!("guardian: kill switch suppressed: audit entry was not written");
    }

    0
}
