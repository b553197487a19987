//! Append-only audit trail with a SHA-256 hash chain.
//!
//! Every decision becomes one JSON line. Entries chain: each hash covers the
//! previous entry's hash string plus the new entry serialized without its
//! `hash` key, so editing any recorded field breaks every later hash.
//! Canonicalization is the writer's own serialization — fixed key order,
//! no whitespace — which is why `serde_json` runs with `preserve_order`.
//!
//! On the first write after process start (and after every rotation) the
//! writer reads the tail of the current file to recover the last sequence
//! number and hash; a corrupt trailing line starts the chain over. The append
//! itself happens under an `fs2` exclusive lock so parallel hook processes
//! do not interleave partial lines.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as FmtWrite;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::policy::{self, AuditConfig, Integrity, Rotation, Severity};

/// Audit entry schema version.
pub const AUDIT_VERSION: u32 = 1;

/// Error raised by the audit writer or verifier.
#[derive(Debug)]
pub enum AuditError {
    Io(io::Error),
    Serialize(serde_json::Error),
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "audit io error: {e}"),
            Self::Serialize(e) => write!(f, "audit serialize error: {e}"),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<io::Error> for AuditError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialize(e)
    }
}

/// Budget figures echoed into an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub remaining_usd: Option<f64>,
    pub action_count: u64,
}

/// One audit line. Field order is the canonical key order; `hash` must stay
/// last and is skipped while computing the chain input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub v: u32,
    pub ts: String,
    pub sid: Option<String>,
    pub seq: u64,
    pub tool: String,
    pub input: Option<serde_json::Value>,
    pub allowed: bool,
    pub reason: Option<String>,
    pub severity: Option<Severity>,
    pub policy_match: Option<String>,
    pub budget: Option<BudgetSnapshot>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Decision fields supplied by the caller; the writer adds `v`, `ts`, `seq`,
/// and `hash`.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub sid: Option<String>,
    pub tool: String,
    pub input: Option<serde_json::Value>,
    pub allowed: bool,
    pub reason: Option<String>,
    pub severity: Option<Severity>,
    pub policy_match: Option<String>,
    pub budget: Option<BudgetSnapshot>,
    pub cwd: String,
}

struct TailState {
    path: PathBuf,
    seq: u64,
    last_hash: String,
}

/// The audit writer: sequence and last-hash state plus the append logic.
///
/// The hook owns one process-wide instance behind a mutex; tests construct
/// their own.
pub struct AuditWriter {
    state: Option<TailState>,
}

/// Process-wide writer used by the hook adapter.
pub static WRITER: Mutex<AuditWriter> = Mutex::new(AuditWriter::new());

impl AuditWriter {
    #[must_use]
    pub const fn new() -> Self {
        Self { state: None }
    }

    /// Append one entry, rotating and recovering tail state as needed.
    ///
    /// Returns the written entry (with `seq`, `ts`, and `hash` filled in).
    ///
    /// # Errors
    /// [`AuditError`] on directory creation, rename, serialization, or write
    /// failure.
    pub fn append(
        &mut self,
        cwd: &Path,
        config: &AuditConfig,
        draft: EntryDraft,
    ) -> Result<AuditEntry, AuditError> {
        let path = policy::resolve_path_value(&config.path, cwd);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let now = Utc::now();
        if rotate_if_needed(&path, config, now)? {
            self.state = None;
        }

        let stale = self.state.as_ref().map_or(true, |s| s.path != path);
        if stale {
            let (seq, last_hash) = load_tail(&path);
            self.state = Some(TailState {
                path: path.clone(),
                seq,
                last_hash,
            });
        }

        let state = self.state.as_mut().expect("tail state just loaded");

        let mut entry = AuditEntry {
            v: AUDIT_VERSION,
            ts: format_timestamp(now),
            sid: draft.sid,
            seq: state.seq + 1,
            tool: draft.tool,
            input: draft.input,
            allowed: draft.allowed,
            reason: draft.reason,
            severity: draft.severity,
            policy_match: draft.policy_match,
            budget: draft.budget,
            cwd: draft.cwd,
            hash: None,
        };

        let body = serde_json::to_string(&entry)?;
        let hash = match config.integrity {
            Integrity::Sha256Chain => chain_hash(&state.last_hash, &body),
            Integrity::None => "none".to_string(),
        };
        entry.hash = Some(hash.clone());
        let line = serde_json::to_string(&entry)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.lock_exclusive()?;
        let write_result = write_line(&file, &line);
        let _ = fs2::FileExt::unlock(&file);
        write_result?;

        state.seq = entry.seq;
        state.last_hash = hash;

        Ok(entry)
    }
}

impl Default for AuditWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_line(mut file: &fs::File, line: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf)?;
    file.sync_data()
}

/// UTC ISO-8601 with millisecond precision.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn chain_hash(last_hash: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(last_hash.as_bytes());
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256:");
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Recover `(seq, last_hash)` from the final line of the current file.
///
/// A missing file, an empty file, or a corrupt trailing line all yield
/// `(0, "")`: the next entry starts a fresh chain at sequence 1.
fn load_tail(path: &Path) -> (u64, String) {
    let Ok(content) = fs::read_to_string(path) else {
        return (0, String::new());
    };
    let Some(last_line) = content.lines().rev().find(|l| !l.trim().is_empty()) else {
        return (0, String::new());
    };
    match serde_json::from_str::<AuditEntry>(last_line) {
        Ok(entry) => match entry.hash {
            Some(hash) => (entry.seq, hash),
            None => (0, String::new()),
        },
        Err(_) => (0, String::new()),
    }
}

/// Rotate the file when it exceeds the size cap, or (under daily rotation)
/// when its modification date is no longer today. Returns true if a rotation
/// happened.
fn rotate_if_needed(path: &Path, config: &AuditConfig, now: DateTime<Utc>) -> io::Result<bool> {
    let Ok(meta) = fs::metadata(path) else {
        return Ok(false);
    };

    let size_exceeded = meta.len() > config.max_file_size_mb.saturating_mul(1024 * 1024);

    let mtime: DateTime<Utc> = meta.modified()?.into();
    let date_changed =
        config.rotation == Rotation::Daily && mtime.date_naive() != now.date_naive();

    if !size_exceeded && !date_changed {
        return Ok(false);
    }

    let target = rotated_name(path, mtime);
    fs::rename(path, target)?;
    Ok(true)
}

/// `<base>.<YYYY-MM-DD><ext>`, with a `.N` disambiguator when taken.
fn rotated_name(path: &Path, mtime: DateTime<Utc>) -> PathBuf {
    let dir = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let stem = path
        .file_stem()
        .map_or_else(String::new, |s| s.to_string_lossy().into_owned());
    let ext = path
        .extension()
        .map_or_else(String::new, |e| format!(".{}", e.to_string_lossy()));
    let date = mtime.format("%Y-%m-%d");

    let candidate = dir.join(format!("{stem}.{date}{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}.{date}.{n}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

// ----------------------------------------------------------------------------
// Verification
// ----------------------------------------------------------------------------

/// Result of scanning an audit file top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub valid: bool,
    pub entries: usize,
    /// 1-based index of the first broken or unparseable line.
    pub broken_at: Option<usize>,
}

impl ChainReport {
    const fn valid(entries: usize) -> Self {
        Self {
            valid: true,
            entries,
            broken_at: None,
        }
    }

    const fn broken(entries: usize, at: usize) -> Self {
        Self {
            valid: false,
            entries,
            broken_at: Some(at),
        }
    }
}

/// Recompute every hash in the file and report the first mismatch.
///
/// The canonical bytes for each entry are recovered by slicing the `hash` key
/// off the raw line, so verification does not depend on re-serialization.
/// Entries recorded with `integrity = "none"` carry the literal hash `"none"`
/// and pass without a chain check. An empty or absent file is valid with zero
/// entries.
///
/// # Errors
/// [`AuditError::Io`] only for read failures other than the file not
/// existing.
pub fn verify_chain(path: &Path) -> Result<ChainReport, AuditError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ChainReport::valid(0)),
        Err(e) => return Err(e.into()),
    };

    let mut last_hash = String::new();
    let mut entries = 0usize;

    for (idx, line) in content.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        let index = idx + 1;

        let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
            return Ok(ChainReport::broken(entries, index));
        };
        let Some(hash) = entry.hash else {
            return Ok(ChainReport::broken(entries, index));
        };

        if hash == "none" {
            last_hash = hash;
            entries += 1;
            continue;
        }

        // The hash key is always serialized last; everything before it is the
        // canonical body.
        let Some(pos) = line.rfind(",\"hash\":") else {
            return Ok(ChainReport::broken(entries, index));
        };
        let body = format!("{}}}", &line[..pos]);

        let expected = chain_hash(&last_hash, &body);
        if expected != hash {
            return Ok(ChainReport::broken(entries, index));
        }

        last_hash = hash;
        entries += 1;
    }

    Ok(ChainReport::valid(entries))
}

// ----------------------------------------------------------------------------
// Summary
// ----------------------------------------------------------------------------

/// Tallies over an audit file for `guardian audit summary`.
#[derive(Debug, Default, Clone)]
pub struct AuditSummary {
    pub total: u64,
    pub allowed: u64,
    pub denied: u64,
    pub by_tool: std::collections::BTreeMap<String, u64>,
    pub by_severity: std::collections::BTreeMap<&'static str, u64>,
}

/// Tally entries in the audit file; unparseable lines are skipped.
///
/// # Errors
/// [`AuditError::Io`] when the file exists but cannot be read.
pub fn summarize(path: &Path) -> Result<AuditSummary, AuditError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(AuditSummary::default()),
        Err(e) => return Err(e.into()),
    };

    let mut summary = AuditSummary::default();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
            continue;
        };
        summary.total += 1;
        if entry.allowed {
            summary.allowed += 1;
        } else {
            summary.denied += 1;
        }
        *summary.by_tool.entry(entry.tool).or_insert(0) += 1;
        if let Some(severity) = entry.severity {
            *summary.by_severity.entry(severity.label()).or_insert(0) += 1;
        }
    }
    Ok(summary)
}
