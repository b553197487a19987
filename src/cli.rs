//! CLI argument parsing and command handling.
//!
//! The hook protocol is the default (no-subcommand) mode; the subcommands
//! here are the operator surface: scaffolding a policy, inspecting it,
//! verifying the audit chain, and dry-running commands against the pipeline.
//!
//! Unlike the hook adapter, CLI commands surface errors and exit non-zero.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use crate::audit;
use crate::budget::{self, BudgetTracker};
use crate::bundle;
use crate::hook::{self, HookInput};
use crate::pipeline;
use crate::policy::{self, GUARDIAN_DIR};

/// Policy gatekeeper hook for AI coding agents.
///
/// Without a subcommand, guardian runs in hook mode: it reads one pre-tool-use
/// request from stdin and answers an allow/deny decision on stdout, recording
/// the decision in a hash-chained audit log.
#[derive(Parser, Debug)]
#[command(name = "guardian")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run (omit to run in hook mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scaffold .guardian/policy.json with the built-in default policy
    #[command(name = "init")]
    Init {
        /// Overwrite an existing policy file
        #[arg(long)]
        force: bool,
    },

    /// Run the hook adapter (read one request from stdin, answer on stdout)
    #[command(name = "validate")]
    Validate,

    /// Load the policy and print a summary
    #[command(name = "check")]
    Check,

    /// Inspect the audit trail
    #[command(name = "audit")]
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Dry-run the pipeline against a Bash command
    #[command(name = "test")]
    TestCommand {
        /// Command to test
        command: String,
    },

    /// Show budget limits and the current cost-file reading
    #[command(name = "budget")]
    Budget,
}

/// `guardian audit` subcommands
#[derive(Subcommand, Debug)]
pub enum AuditAction {
    /// Recompute the hash chain and report the first broken entry
    #[command(name = "verify")]
    Verify,

    /// Tally allowed/denied decisions by tool and severity
    #[command(name = "summary")]
    Summary,
}

/// Dispatch a parsed CLI invocation.
///
/// # Errors
/// Returns an error (printed by `main`, which then exits non-zero) for any
/// failure: missing/invalid policy, IO problems, or a failed verification.
pub fn run_command(cli: Cli) -> Result<(), Box<dyn Error>> {
    let cwd = std::env::current_dir()?;
    match cli.command {
        Some(Command::Init { force }) => run_init(&cwd, force),
        Some(Command::Validate) => {
            let code = hook::run();
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Some(Command::Check) => run_check(&cwd),
        Some(Command::Audit { action }) => match action {
            AuditAction::Verify => run_audit_verify(&cwd),
            AuditAction::Summary => run_audit_summary(&cwd),
        },
        Some(Command::TestCommand { command }) => run_test(&cwd, &command),
        Some(Command::Budget) => run_budget(&cwd),
        None => Err("no subcommand provided".into()),
    }
}

// ----------------------------------------------------------------------------
// init
// ----------------------------------------------------------------------------

const GITIGNORE_MARKER: &str = ".guardian/audit";
const GITIGNORE_BLOCK: &str = "\n# Guardian audit logs\n.guardian/audit.jsonl\n.guardian/audit.*.jsonl\n";

fn run_init(cwd: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    let dir = cwd.join(GUARDIAN_DIR);
    fs::create_dir_all(&dir)?;

    let path = policy::policy_path(cwd);
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    let json = serde_json::to_string_pretty(&bundle::default_policy())?;
    fs::write(&path, json + "\n")?;
    println!("{} wrote {}", "✓".green(), path.display());

    amend_gitignore(cwd)?;
    Ok(())
}

fn amend_gitignore(cwd: &Path) -> Result<(), Box<dyn Error>> {
    let path = cwd.join(".gitignore");
    let existing = fs::read_to_string(&path).unwrap_or_default();
    if existing.contains(GITIGNORE_MARKER) {
        return Ok(());
    }
    fs::write(&path, existing + GITIGNORE_BLOCK)?;
    println!("{} amended {}", "✓".green(), path.display());
    Ok(())
}

// ----------------------------------------------------------------------------
// check
// ----------------------------------------------------------------------------

fn run_check(cwd: &Path) -> Result<(), Box<dyn Error>> {
    let compiled = policy::load(cwd)?;
    let p = &compiled.policy;

    println!("{}", "Guardian policy".bold());
    println!("  file:    {}", policy::policy_path(cwd).display());
    println!("  mode:    {}", p.mode.label().cyan());
    println!(
        "  rules:   {} command, {} file, {} secret, {} network",
        compiled.commands.len(),
        compiled.file_rules.len(),
        compiled.secrets.len(),
        compiled.network.len()
    );
    println!(
        "  allow:   {} commands, {} paths, {} domains",
        p.allowlist.commands.len(),
        p.allowlist.paths.len(),
        p.allowlist.domains.len()
    );
    println!(
        "  scope:   {} allowed, {} denied, outside cwd {}",
        p.scope.allowed_paths.len(),
        p.scope.denied_paths.len(),
        if p.scope.allow_outside_cwd {
            "permitted".yellow()
        } else {
            "denied".green()
        }
    );
    if p.budget.enabled {
        println!(
            "  budget:  max {} actions, limit {}",
            p.budget.max_actions_per_session,
            p.budget
                .session_limit_usd
                .map_or_else(|| "none".to_string(), |l| format!("${l:.2}")),
        );
    } else {
        println!("  budget:  {}", "disabled".yellow());
    }
    println!(
        "  audit:   {} ({}, rotation {:?})",
        if p.audit.enabled {
            "enabled".green()
        } else {
            "disabled".red()
        },
        p.audit.path,
        p.audit.rotation
    );
    println!(
        "  kill:    {} (exit code {})",
        if p.kill_switch.enabled {
            "enabled".green()
        } else {
            "disabled".yellow()
        },
        p.kill_switch.exit_code
    );
    Ok(())
}

// ----------------------------------------------------------------------------
// audit verify / summary
// ----------------------------------------------------------------------------

fn audit_path(cwd: &Path) -> Result<PathBuf, Box<dyn Error>> {
    let compiled = policy::load(cwd)?;
    Ok(policy::resolve_path_value(&compiled.policy.audit.path, cwd))
}

fn run_audit_verify(cwd: &Path) -> Result<(), Box<dyn Error>> {
    let path = audit_path(cwd)?;
    let report = audit::verify_chain(&path)?;

    if report.valid {
        println!(
            "{} chain intact: {} entries in {}",
            "✓".green(),
            report.entries,
            path.display()
        );
        Ok(())
    } else {
        let at = report.broken_at.unwrap_or(0);
        println!(
            "{} chain broken at line {at} ({} entries verified) in {}",
            "✗".red(),
            report.entries,
            path.display()
        );
        Err("audit chain verification failed".into())
    }
}

fn run_audit_summary(cwd: &Path) -> Result<(), Box<dyn Error>> {
    let path = audit_path(cwd)?;
    let summary = audit::summarize(&path)?;

    println!("{}", "Audit summary".bold());
    println!("  entries: {}", summary.total);
    println!(
        "  allowed: {}   denied: {}",
        summary.allowed.to_string().green(),
        summary.denied.to_string().red()
    );
    if !summary.by_tool.is_empty() {
        println!("  by tool:");
        for (tool, count) in &summary.by_tool {
            println!("    {tool:<12} {count}");
        }
    }
    if !summary.by_severity.is_empty() {
        println!("  by severity:");
        for (severity, count) in &summary.by_severity {
            println!("    {severity:<12} {count}");
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// test / budget
// ----------------------------------------------------------------------------

fn run_test(cwd: &Path, command: &str) -> Result<(), Box<dyn Error>> {
    let compiled = policy::load(cwd)?;

    let mut tool_input = serde_json::Map::new();
    tool_input.insert(
        "command".to_string(),
        serde_json::Value::String(command.to_string()),
    );
    let input = HookInput {
        tool_name: pipeline::TOOL_BASH.to_string(),
        tool_input,
        session_id: None,
        cwd: None,
    };

    // Dry run: throwaway counter, no audit entry, no kill.
    let tracker = BudgetTracker::new();
    let result = pipeline::evaluate(&input, &compiled, cwd, &tracker);

    if result.allowed {
        println!("{} {command}", "ALLOWED".green().bold());
    } else {
        println!("{} {command}", "DENIED".red().bold());
    }
    if let Some(reason) = &result.reason {
        println!("  reason:   {reason}");
    }
    if let Some(severity) = result.severity {
        println!("  severity: {}", severity.label());
    }
    if let Some(source) = result.source {
        println!("  source:   {}", source.label());
    }
    if let Some(pattern) = &result.pattern {
        println!("  pattern:  {pattern}");
    }
    Ok(())
}

fn run_budget(cwd: &Path) -> Result<(), Box<dyn Error>> {
    let compiled = policy::load(cwd)?;
    let cfg = &compiled.policy.budget;

    println!("{}", "Budget".bold());
    if !cfg.enabled {
        println!("  {}", "disabled".yellow());
        return Ok(());
    }
    println!(
        "  max actions: {}",
        if cfg.max_actions_per_session == 0 {
            "unlimited".to_string()
        } else {
            cfg.max_actions_per_session.to_string()
        }
    );
    println!(
        "  usd limit:   {}",
        cfg.session_limit_usd
            .map_or_else(|| "none".to_string(), |l| format!("${l:.2}"))
    );
    match cfg.cost_file.as_deref() {
        None => println!("  cost file:   none configured"),
        Some(file) => match budget::read_cost(cfg, cwd) {
            Some(cost) => {
                println!("  cost file:   {file}");
                println!("  session cost: ${cost:.2}");
                if let Some(remaining) = budget::remaining_usd(cfg, Some(cost)) {
                    println!("  remaining:   ${remaining:.2}");
                }
            }
            None => println!("  cost file:   {file} ({})", "unreadable".yellow()),
        },
    }
    Ok(())
}
