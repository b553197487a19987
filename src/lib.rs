#![forbid(unsafe_code)]
//! Guardian library.
//!
//! Guardian is a synchronous gatekeeper invoked before each tool call an
//! autonomous coding agent makes. It reads one structured request on stdin,
//! consults the declarative policy at `.guardian/policy.json`, answers
//! allow/deny on stdout, and appends a tamper-evident record of the decision
//! to a hash-chained audit log. Qualifying violations terminate the agent
//! session through the kill switch.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Policy loader                              │
//! │     (.guardian/policy.json → validated, compiled, cached)       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Decision pipeline                           │
//! │        allowlist → scope → blocklist → budget (in order)        │
//! │   (Bash commands pass through the shell preprocessor first)     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Audit writer → kill controller                  │
//! │   (SHA-256 hash chain, rotation, resume; write-then-kill)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The hook adapter around all of this is fail-open: an internal fault
//! degrades to an allow with a stderr note, never a stuck agent.

pub mod audit;
pub mod budget;
pub mod bundle;
pub mod cli;
pub mod hook;
pub mod kill;
pub mod pipeline;
pub mod policy;
pub mod regex_engine;
pub mod shell;

// Re-export commonly used types
pub use audit::{AuditEntry, AuditError, AuditSummary, AuditWriter, BudgetSnapshot, ChainReport};
pub use budget::{BudgetState, BudgetTracker, CostSnapshot};
pub use hook::{HookInput, HookOutput};
pub use pipeline::{Source, ValidationResult};
pub use policy::{
    CompiledPolicy, FileOperation, Integrity, Mode, Policy, PolicyError, Rotation, Severity,
};
pub use regex_engine::{needs_backtracking_engine, CompiledRegex};
