//! Policy document loading, validation, and caching.
//!
//! The policy lives at `<cwd>/.guardian/policy.json`. It is parsed and
//! validated once, compiled (every regex eagerly), and cached keyed on the
//! file's modification timestamp: repeated hook invocations in a reused
//! process skip the parse entirely until the file changes on disk.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::regex_engine::CompiledRegex;

/// Directory under the working directory that holds Guardian state.
pub const GUARDIAN_DIR: &str = ".guardian";

/// Policy file name inside [`GUARDIAN_DIR`].
pub const POLICY_FILE: &str = "policy.json";

/// The only policy schema version this build understands.
pub const POLICY_VERSION: u32 = 1;

/// Top-level keys that must be present in the policy document.
///
/// `budget` is deliberately absent: it defaults when omitted.
const REQUIRED_KEYS: &[&str] = &[
    "version",
    "mode",
    "blocklist",
    "allowlist",
    "scope",
    "audit",
    "kill_switch",
];

/// Error raised while loading or compiling a policy.
#[derive(Debug)]
pub enum PolicyError {
    /// No policy file at the expected path.
    Missing(PathBuf),
    /// JSON parse failure or schema violation.
    Invalid(String),
    /// A blocklist regex failed to compile.
    Pattern { pattern: String, message: String },
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(path) => write!(f, "policy file not found at {}", path.display()),
            Self::Invalid(msg) => write!(f, "invalid policy: {msg}"),
            Self::Pattern { pattern, message } => {
                write!(f, "invalid pattern `{pattern}`: {message}")
            }
        }
    }
}

impl std::error::Error for PolicyError {}

/// Enforcement mode for the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Evaluate and deny on violations.
    Enforce,
    /// Evaluate, record violations, but always allow.
    Audit,
    /// Skip evaluation entirely.
    Off,
}

impl Mode {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Audit => "audit",
            Self::Off => "off",
        }
    }
}

/// Severity of a matched pattern.
///
/// Only `critical` can arm the kill switch via `on_blocklist_critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Operations a file pattern applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Delete,
    GitAdd,
}

/// A regex rule against Bash command text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPattern {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    pub severity: Severity,
    pub reason: String,
}

/// A regex rule against file paths, gated by operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePattern {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    pub operations: Vec<FileOperation>,
    pub severity: Severity,
    pub reason: String,
}

/// A regex rule against written content (secret material).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretPattern {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    pub severity: Severity,
    pub reason: String,
}

/// A regex rule against URLs and raw commands (network egress).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPattern {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    pub severity: Severity,
    pub reason: String,
}

/// The four blocklist collections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Blocklist {
    pub commands: Vec<CommandPattern>,
    pub file_patterns: Vec<FilePattern>,
    pub secret_patterns: Vec<SecretPattern>,
    pub network: Vec<NetworkPattern>,
}

/// Exact-match bypass lists consulted before every other gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowlistConfig {
    /// Exact Bash command strings.
    pub commands: Vec<String>,
    /// Path prefixes for tools carrying `file_path`.
    pub paths: Vec<String>,
    /// Exact hosts for `WebFetch`.
    pub domains: Vec<String>,
}

/// File-system region the agent may touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Allowed path templates; the literal token `{cwd}` expands to the
    /// working directory.
    pub allowed_paths: Vec<String>,
    /// Denied path prefixes, checked before allowed paths.
    pub denied_paths: Vec<String>,
    /// When false, paths outside every allowed template are denied.
    pub allow_outside_cwd: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            allowed_paths: vec!["{cwd}".to_string()],
            denied_paths: Vec::new(),
            allow_outside_cwd: false,
        }
    }
}

/// What to do when the budget gate reports a breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreachAction {
    /// Deny the request (the default).
    #[default]
    Block,
    /// Deny and arm the kill switch's budget path.
    Kill,
}

/// Budget gate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub enabled: bool,
    /// 0 disables the action-count check.
    pub max_actions_per_session: u64,
    pub session_limit_usd: Option<f64>,
    /// Cost snapshot file produced by the agent runtime.
    pub cost_file: Option<String>,
    pub action_on_breach: BreachAction,
}

/// Audit file rotation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    /// Rotate on size, and additionally when the UTC date changes.
    #[default]
    Daily,
    /// Rotate on size only.
    Size,
}

/// Audit entry integrity scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Integrity {
    #[default]
    #[serde(rename = "sha256-chain")]
    Sha256Chain,
    #[serde(rename = "none")]
    None,
}

/// Audit writer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Relative to the working directory unless absolute (`~` expands).
    pub path: String,
    pub max_file_size_mb: u64,
    pub rotation: Rotation,
    pub integrity: Integrity,
    /// Echo the tool input into audit entries.
    pub include_tool_input: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: format!("{GUARDIAN_DIR}/audit.jsonl"),
            max_file_size_mb: 10,
            rotation: Rotation::Daily,
            integrity: Integrity::Sha256Chain,
            include_tool_input: true,
        }
    }
}

/// Kill-switch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    pub enabled: bool,
    /// Terminate on blocklist denials with `critical` severity.
    pub on_blocklist_critical: bool,
    /// Terminate on budget breaches when `action_on_breach = "kill"`.
    pub on_budget_breach: bool,
    pub exit_code: i32,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_blocklist_critical: true,
            on_budget_breach: false,
            exit_code: 2,
        }
    }
}

/// The root policy document (version 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub version: u32,
    pub mode: Mode,
    #[serde(default)]
    pub blocklist: Blocklist,
    #[serde(default)]
    pub allowlist: AllowlistConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
}

// ----------------------------------------------------------------------------
// Compiled form
// ----------------------------------------------------------------------------

/// A compiled blocklist rule: the regex plus the metadata recorded on match.
#[derive(Debug)]
pub struct CompiledRule {
    pub regex: CompiledRegex,
    pub severity: Severity,
    pub reason: String,
    /// The original pattern text (recorded as `policy_match` in audit entries).
    pub pattern: String,
}

/// A compiled file rule with its operation gate.
#[derive(Debug)]
pub struct CompiledFileRule {
    pub rule: CompiledRule,
    pub operations: Vec<FileOperation>,
}

impl CompiledFileRule {
    #[must_use]
    pub fn applies_to(&self, op: FileOperation) -> bool {
        self.operations.contains(&op)
    }
}

/// A policy with every blocklist regex compiled.
#[derive(Debug)]
pub struct CompiledPolicy {
    pub policy: Policy,
    pub commands: Vec<CompiledRule>,
    pub file_rules: Vec<CompiledFileRule>,
    pub secrets: Vec<CompiledRule>,
    pub network: Vec<CompiledRule>,
}

fn compile_rule(
    pattern: &str,
    flags: Option<&str>,
    severity: Severity,
    reason: &str,
) -> Result<CompiledRule, PolicyError> {
    let case_insensitive = flags.is_some_and(|f| f.contains('i'));
    let regex =
        CompiledRegex::new(pattern, case_insensitive).map_err(|message| PolicyError::Pattern {
            pattern: pattern.to_string(),
            message,
        })?;
    Ok(CompiledRule {
        regex,
        severity,
        reason: reason.to_string(),
        pattern: pattern.to_string(),
    })
}

impl CompiledPolicy {
    /// Compile every blocklist pattern in `policy`.
    ///
    /// # Errors
    /// Returns [`PolicyError::Pattern`] for the first pattern that fails to
    /// compile; a policy with an uncompilable pattern never loads.
    pub fn compile(policy: Policy) -> Result<Self, PolicyError> {
        let mut commands = Vec::with_capacity(policy.blocklist.commands.len());
        for p in &policy.blocklist.commands {
            commands.push(compile_rule(
                &p.pattern,
                p.flags.as_deref(),
                p.severity,
                &p.reason,
            )?);
        }

        let mut file_rules = Vec::with_capacity(policy.blocklist.file_patterns.len());
        for p in &policy.blocklist.file_patterns {
            file_rules.push(CompiledFileRule {
                rule: compile_rule(&p.pattern, p.flags.as_deref(), p.severity, &p.reason)?,
                operations: p.operations.clone(),
            });
        }

        let mut secrets = Vec::with_capacity(policy.blocklist.secret_patterns.len());
        for p in &policy.blocklist.secret_patterns {
            secrets.push(compile_rule(
                &p.pattern,
                p.flags.as_deref(),
                p.severity,
                &p.reason,
            )?);
        }

        let mut network = Vec::with_capacity(policy.blocklist.network.len());
        for p in &policy.blocklist.network {
            network.push(compile_rule(
                &p.pattern,
                p.flags.as_deref(),
                p.severity,
                &p.reason,
            )?);
        }

        Ok(Self {
            policy,
            commands,
            file_rules,
            secrets,
            network,
        })
    }
}

// ----------------------------------------------------------------------------
// Loading and caching
// ----------------------------------------------------------------------------

struct CacheSlot {
    path: PathBuf,
    mtime: SystemTime,
    compiled: Arc<CompiledPolicy>,
}

static CACHE: Mutex<Option<CacheSlot>> = Mutex::new(None);

/// The expected policy path for a working directory.
#[must_use]
pub fn policy_path(cwd: &Path) -> PathBuf {
    cwd.join(GUARDIAN_DIR).join(POLICY_FILE)
}

/// Parse and validate a policy document from raw JSON text.
///
/// # Errors
/// [`PolicyError::Invalid`] on parse failure, a missing required key, or an
/// unsupported version.
pub fn parse_policy(raw: &str) -> Result<Policy, PolicyError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| PolicyError::Invalid(e.to_string()))?;

    let obj = value
        .as_object()
        .ok_or_else(|| PolicyError::Invalid("policy root must be a JSON object".to_string()))?;
    for key in REQUIRED_KEYS {
        if !obj.contains_key(*key) {
            return Err(PolicyError::Invalid(format!(
                "missing required key `{key}`"
            )));
        }
    }

    let policy: Policy =
        serde_json::from_value(value).map_err(|e| PolicyError::Invalid(e.to_string()))?;

    if policy.version != POLICY_VERSION {
        return Err(PolicyError::Invalid(format!(
            "unsupported policy version {} (expected {POLICY_VERSION})",
            policy.version
        )));
    }

    Ok(policy)
}

/// Load the policy for `cwd`, consulting the process-wide cache.
///
/// The cache is keyed on the policy file's modification timestamp; an
/// unchanged timestamp returns the previously compiled policy without
/// re-reading the file. A disappeared or unstattable file forces a reload.
///
/// # Errors
/// [`PolicyError::Missing`] when the file does not exist, otherwise
/// [`PolicyError::Invalid`] / [`PolicyError::Pattern`].
pub fn load(cwd: &Path) -> Result<Arc<CompiledPolicy>, PolicyError> {
    let path = policy_path(cwd);
    let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();

    if let Some(mtime) = mtime {
        let cache = CACHE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(slot) = cache.as_ref() {
            if slot.path == path && slot.mtime == mtime {
                return Ok(Arc::clone(&slot.compiled));
            }
        }
    }

    let raw = fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PolicyError::Missing(path.clone())
        } else {
            PolicyError::Invalid(format!("cannot read {}: {e}", path.display()))
        }
    })?;

    let policy = parse_policy(&raw)?;
    let compiled = Arc::new(CompiledPolicy::compile(policy)?);

    if let Some(mtime) = mtime {
        let mut cache = CACHE.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *cache = Some(CacheSlot {
            path,
            mtime,
            compiled: Arc::clone(&compiled),
        });
    }

    Ok(compiled)
}

/// Resolve a configured path value against a working directory.
///
/// `~`-prefixed values expand against the home directory; relative values
/// resolve against `cwd`; absolute values pass through.
#[must_use]
pub fn resolve_path_value(value: &str, cwd: &Path) -> PathBuf {
    if value == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
        return PathBuf::from(value);
    }
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
        return PathBuf::from(value);
    }

    let path = Path::new(value);
    if path.is_relative() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}
