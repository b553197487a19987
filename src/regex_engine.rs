//! Dual regex engine abstraction for policy pattern matching.
//!
//! Most policy patterns are plain alternation/repetition and compile on the
//! linear-time `regex` crate (O(n) guaranteed, no pathological inputs). A
//! minority use look-around or backreferences, which only the backtracking
//! `fancy_regex` engine supports. [`CompiledRegex::new`] inspects the pattern
//! text and picks the engine automatically.
//!
//! Patterns are compiled eagerly, once per policy load: a policy containing an
//! uncompilable pattern must fail the load rather than silently lose coverage.

/// A compiled regex that auto-selects between linear-time and backtracking engines.
#[derive(Debug)]
pub enum CompiledRegex {
    /// Linear-time regex (O(n) guaranteed, no backtracking).
    Linear(regex::Regex),
    /// Backtracking regex (supports lookahead/lookbehind).
    Backtracking(fancy_regex::Regex),
}

impl CompiledRegex {
    /// Compile a pattern, auto-selecting the appropriate engine.
    ///
    /// `case_insensitive` corresponds to the policy `flags` field containing
    /// `"i"` and applies to either engine.
    ///
    /// # Errors
    /// Returns a human-readable message if the pattern fails to compile.
    pub fn new(pattern: &str, case_insensitive: bool) -> Result<Self, String> {
        if needs_backtracking_engine(pattern) {
            fancy_regex::RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map(Self::Backtracking)
                .map_err(|e| format!("fancy_regex compile error: {e}"))
        } else {
            regex::RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map(Self::Linear)
                .map_err(|e| format!("regex compile error: {e}"))
        }
    }

    /// Check if the pattern matches the text.
    ///
    /// For the backtracking engine, returns `false` on regex execution errors.
    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Linear(re) => re.is_match(text),
            Self::Backtracking(re) => re.is_match(text).unwrap_or(false),
        }
    }

    /// Get the pattern string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Linear(re) => re.as_str(),
            Self::Backtracking(re) => re.as_str(),
        }
    }

    /// Check if this regex uses the backtracking engine.
    #[must_use]
    pub const fn uses_backtracking(&self) -> bool {
        matches!(self, Self::Backtracking(_))
    }
}

/// Check if a pattern requires the backtracking engine.
///
/// Returns `true` if the pattern contains features not supported by the
/// linear-time `regex` crate:
/// - Lookahead: `(?=...)`, `(?!...)`
/// - Lookbehind: `(?<=...)`, `(?<!...)`
/// - Atomic groups: `(?>...)`
/// - Backreferences: `\1` through `\9`
///
/// This is a syntactic heuristic; false positives merely select the slower
/// engine, which still compiles the pattern correctly.
#[must_use]
pub fn needs_backtracking_engine(pattern: &str) -> bool {
    if pattern.contains("(?=")
        || pattern.contains("(?!")
        || pattern.contains("(?<=")
        || pattern.contains("(?<!")
        || pattern.contains("(?>")
    {
        return true;
    }

    let bytes = pattern.as_bytes();
    for i in 0..bytes.len().saturating_sub(1) {
        if bytes[i] == b'\\' {
            let next = bytes[i + 1];
            if next.is_ascii_digit() && next != b'0' {
                return true;
            }
        }
    }

    false
}
