//! End-to-end tests driving the built binary over the hook protocol.
//!
//! Each test gets its own tempdir with a scaffolded policy; requests carry
//! `cwd` explicitly so the spawned process never depends on the test runner's
//! working directory.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use guardian::bundle;
use guardian::policy::{GUARDIAN_DIR, POLICY_FILE};

fn guardian_binary() -> &'static str {
    env!("CARGO_BIN_EXE_guardian")
}

/// Write the default policy into `dir`, with `patch` applied to the JSON.
fn write_policy(dir: &Path, patch: impl FnOnce(&mut serde_json::Value)) {
    let mut value = serde_json::to_value(bundle::default_policy()).unwrap();
    patch(&mut value);

    let guardian_dir = dir.join(GUARDIAN_DIR);
    std::fs::create_dir_all(&guardian_dir).unwrap();
    std::fs::write(
        guardian_dir.join(POLICY_FILE),
        serde_json::to_string_pretty(&value).unwrap(),
    )
    .unwrap();
}

fn run_hook_raw(dir: &Path, stdin: &str) -> Output {
    let mut child = Command::new(guardian_binary())
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn guardian");

    child
        .stdin
        .as_mut()
        .expect("stdin")
        .write_all(stdin.as_bytes())
        .unwrap();

    child.wait_with_output().expect("failed to wait for guardian")
}

fn run_hook(dir: &Path, tool_name: &str, tool_input: serde_json::Value) -> Output {
    let input = serde_json::json!({
        "tool_name": tool_name,
        "tool_input": tool_input,
        "session_id": "e2e-session",
        "cwd": dir.to_string_lossy(),
    });
    run_hook_raw(dir, &input.to_string())
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let text = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(text.trim()).unwrap_or_else(|e| panic!("bad stdout {text:?}: {e}"))
}

fn audit_lines(dir: &Path) -> Vec<serde_json::Value> {
    let path = dir.join(GUARDIAN_DIR).join("audit.jsonl");
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn run_subcommand(dir: &Path, args: &[&str]) -> Output {
    Command::new(guardian_binary())
        .current_dir(dir)
        .args(args)
        .output()
        .expect("failed to run guardian subcommand")
}

// ── hook decisions ──

#[test]
fn destructive_command_is_denied_and_kills() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let output = run_hook(dir.path(), "Bash", serde_json::json!({ "command": "rm -rf /" }));

    let decision = stdout_json(&output);
    assert_eq!(decision["permissionDecision"], "deny");
    assert_eq!(decision["reason"], "[Guardian] Forced file deletion");

    // Default kill switch: critical blocklist denial terminates with code 2,
    // after the audit entry was appended.
    assert_eq!(output.status.code(), Some(2));
    let entries = audit_lines(dir.path());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["allowed"], false);
    assert_eq!(entries[0]["severity"], "critical");
    assert_eq!(entries[0]["seq"], 1);
    assert!(entries[0]["policy_match"].as_str().is_some());
}

#[test]
fn quoted_payload_is_allowed() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let output = run_hook(
        dir.path(),
        "Bash",
        serde_json::json!({ "command": "echo \"rm -rf /\"" }),
    );

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)["permissionDecision"], "allow");
}

#[test]
fn chained_payload_is_denied() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let output = run_hook(
        dir.path(),
        "Bash",
        serde_json::json!({ "command": "echo hi && rm -rf /" }),
    );

    assert_eq!(stdout_json(&output)["permissionDecision"], "deny");
}

#[test]
fn metadata_fetch_is_denied_critical() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let output = run_hook(
        dir.path(),
        "WebFetch",
        serde_json::json!({ "url": "http://169.254.169.254/latest/meta-data/" }),
    );

    assert_eq!(stdout_json(&output)["permissionDecision"], "deny");
    assert_eq!(output.status.code(), Some(2));

    let entries = audit_lines(dir.path());
    assert_eq!(entries[0]["severity"], "critical");
}

#[test]
fn out_of_scope_read_is_denied_without_kill() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let output = run_hook(
        dir.path(),
        "Read",
        serde_json::json!({ "file_path": "/etc/passwd" }),
    );

    let decision = stdout_json(&output);
    assert_eq!(decision["permissionDecision"], "deny");
    // Scope denials are high severity, not critical: no kill.
    assert_eq!(output.status.code(), Some(0));

    let entries = audit_lines(dir.path());
    assert_eq!(entries[0]["severity"], "high");
}

#[test]
fn budget_cost_breach_denies() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cost.json"),
        r#"{"session_id":"e2e","total_cost_usd":9.99,"last_updated":"2026-08-02T00:00:00Z"}"#,
    )
    .unwrap();
    write_policy(dir.path(), |v| {
        v["budget"]["enabled"] = serde_json::json!(true);
        v["budget"]["session_limit_usd"] = serde_json::json!(5.0);
        v["budget"]["cost_file"] = serde_json::json!("cost.json");
    });

    let output = run_hook(dir.path(), "Bash", serde_json::json!({ "command": "ls" }));

    let decision = stdout_json(&output);
    assert_eq!(decision["permissionDecision"], "deny");
    assert_eq!(output.status.code(), Some(0));

    let entries = audit_lines(dir.path());
    assert_eq!(entries[0]["allowed"], false);
    let budget = &entries[0]["budget"];
    assert_eq!(budget["action_count"], 1);
    assert!(budget["remaining_usd"].as_f64().unwrap() < 0.0);
}

#[test]
fn budget_breach_with_kill_action_terminates() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cost.json"),
        r#"{"session_id":"e2e","total_cost_usd":11.0}"#,
    )
    .unwrap();
    write_policy(dir.path(), |v| {
        v["budget"]["enabled"] = serde_json::json!(true);
        v["budget"]["session_limit_usd"] = serde_json::json!(10.0);
        v["budget"]["cost_file"] = serde_json::json!("cost.json");
        v["budget"]["action_on_breach"] = serde_json::json!("kill");
        v["kill_switch"]["on_budget_breach"] = serde_json::json!(true);
    });

    let output = run_hook(dir.path(), "Bash", serde_json::json!({ "command": "ls" }));

    assert_eq!(stdout_json(&output)["permissionDecision"], "deny");
    assert_eq!(output.status.code(), Some(2));
    // Write-then-kill: the entry must exist despite the termination.
    assert_eq!(audit_lines(dir.path()).len(), 1);
}

#[test]
fn audit_mode_allows_but_records_violation() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |v| {
        v["mode"] = serde_json::json!("audit");
    });

    let output = run_hook(dir.path(), "Bash", serde_json::json!({ "command": "rm -rf /" }));

    let decision = stdout_json(&output);
    assert_eq!(decision["permissionDecision"], "allow");
    assert!(decision["systemMessage"]
        .as_str()
        .unwrap()
        .contains("Forced file deletion"));
    assert_eq!(output.status.code(), Some(0));

    let entries = audit_lines(dir.path());
    assert_eq!(entries[0]["allowed"], true);
    assert_eq!(entries[0]["severity"], "critical");
    assert_eq!(entries[0]["reason"], "Forced file deletion");
}

#[test]
fn off_mode_allows_everything() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |v| {
        v["mode"] = serde_json::json!("off");
    });

    let output = run_hook(dir.path(), "Bash", serde_json::json!({ "command": "rm -rf /" }));
    assert_eq!(stdout_json(&output)["permissionDecision"], "allow");
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn include_tool_input_false_writes_null_input() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |v| {
        v["audit"]["include_tool_input"] = serde_json::json!(false);
    });

    run_hook(dir.path(), "Bash", serde_json::json!({ "command": "ls" }));

    let entries = audit_lines(dir.path());
    assert!(entries[0]["input"].is_null());
}

// ── fail-open behavior ──

#[test]
fn unparseable_stdin_fails_open_without_audit() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let output = run_hook_raw(dir.path(), "{this is not json");

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), r#"{"permissionDecision":"allow"}"#);
    assert!(audit_lines(dir.path()).is_empty());
}

#[test]
fn empty_stdin_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let output = run_hook_raw(dir.path(), "");
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), r#"{"permissionDecision":"allow"}"#);
}

#[test]
fn missing_policy_fails_open_with_stderr_note() {
    let dir = tempfile::tempdir().unwrap();

    let output = run_hook(dir.path(), "Bash", serde_json::json!({ "command": "rm -rf /" }));

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)["permissionDecision"], "allow");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("policy file not found"));
}

#[test]
fn invalid_policy_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let guardian_dir = dir.path().join(GUARDIAN_DIR);
    std::fs::create_dir_all(&guardian_dir).unwrap();
    std::fs::write(guardian_dir.join(POLICY_FILE), "{broken").unwrap();

    let output = run_hook(dir.path(), "Bash", serde_json::json!({ "command": "rm -rf /" }));

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)["permissionDecision"], "allow");
}

// ── sequencing across processes ──

#[test]
fn audit_chain_survives_process_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    for command in ["ls", "pwd", "git status"] {
        let output = run_hook(dir.path(), "Bash", serde_json::json!({ "command": command }));
        assert_eq!(output.status.code(), Some(0));
    }

    let entries = audit_lines(dir.path());
    let seqs: Vec<u64> = entries.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let verify = run_subcommand(dir.path(), &["audit", "verify"]);
    assert!(verify.status.success(), "{verify:?}");
}

#[test]
fn tampered_audit_file_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    run_hook(dir.path(), "Bash", serde_json::json!({ "command": "ls" }));
    run_hook(dir.path(), "Bash", serde_json::json!({ "command": "pwd" }));

    let path = dir.path().join(GUARDIAN_DIR).join("audit.jsonl");
    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, content.replace("\"tool\":\"Bash\"", "\"tool\":\"Edit\"")).unwrap();

    let verify = run_subcommand(dir.path(), &["audit", "verify"]);
    assert!(!verify.status.success());
    let stdout = String::from_utf8_lossy(&verify.stdout);
    assert!(stdout.contains("broken at line 1"), "{stdout}");
}

// ── CLI surface ──

#[test]
fn init_scaffolds_policy_and_gitignore() {
    let dir = tempfile::tempdir().unwrap();

    let output = run_subcommand(dir.path(), &["init"]);
    assert!(output.status.success(), "{output:?}");
    assert!(dir.path().join(GUARDIAN_DIR).join(POLICY_FILE).exists());

    let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
    assert!(gitignore.contains(".guardian/audit.jsonl"));

    // Refuses to clobber without --force.
    let again = run_subcommand(dir.path(), &["init"]);
    assert!(!again.status.success());
    let forced = run_subcommand(dir.path(), &["init", "--force"]);
    assert!(forced.status.success());
}

#[test]
fn check_prints_policy_summary() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let output = run_subcommand(dir.path(), &["check"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("mode:"));
    assert!(stdout.contains("enforce"));
}

#[test]
fn check_errors_without_policy() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_subcommand(dir.path(), &["check"]);
    assert!(!output.status.success());
}

#[test]
fn test_subcommand_dry_runs_without_audit() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let output = run_subcommand(dir.path(), &["test", "rm -rf /"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("DENIED"));
    assert!(stdout.contains("Forced file deletion"));

    // Dry runs leave no audit trace.
    assert!(audit_lines(dir.path()).is_empty());

    let allowed = run_subcommand(dir.path(), &["test", "git status"]);
    assert!(String::from_utf8_lossy(&allowed.stdout).contains("ALLOWED"));
}

#[test]
fn audit_summary_tallies_decisions() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    run_hook(dir.path(), "Bash", serde_json::json!({ "command": "ls" }));
    run_hook(dir.path(), "Read", serde_json::json!({ "file_path": "/etc/passwd" }));

    let output = run_subcommand(dir.path(), &["audit", "summary"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("entries: 2"), "{stdout}");
    assert!(stdout.contains("Bash"));
    assert!(stdout.contains("Read"));
}

#[test]
fn validate_subcommand_runs_hook_mode() {
    let dir = tempfile::tempdir().unwrap();
    write_policy(dir.path(), |_| {});

    let input = serde_json::json!({
        "tool_name": "Bash",
        "tool_input": { "command": "git status" },
        "cwd": dir.path().to_string_lossy(),
    });

    let mut child = Command::new(guardian_binary())
        .current_dir(dir.path())
        .arg("validate")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(input.to_string().as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["permissionDecision"], "allow");
}

#[test]
fn budget_subcommand_reports_cost() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cost.json"),
        r#"{"session_id":"e2e","total_cost_usd":2.5}"#,
    )
    .unwrap();
    write_policy(dir.path(), |v| {
        v["budget"]["enabled"] = serde_json::json!(true);
        v["budget"]["session_limit_usd"] = serde_json::json!(10.0);
        v["budget"]["cost_file"] = serde_json::json!("cost.json");
    });

    let output = run_subcommand(dir.path(), &["budget"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("$2.50"), "{stdout}");
    assert!(stdout.contains("$7.50"), "{stdout}");
}
