//! Shell-aware preprocessing of Bash command strings.
//!
//! Regex blocklists over raw command text are wrong in both directions:
//! `echo "rm -rf /"` fires on data, while `echo hi && rm -rf /` hides the
//! dangerous half behind a chain operator. This module derives three views of
//! a command so the pipeline can match each one:
//!
//! 1. **Stripped** — quoted regions removed, so patterns never fire on string
//!    literals handed to `echo`, `grep`, `mysql -e`, and friends.
//! 2. **Segments** — the command split at top-level `&&`, `||`, `;`, `|`, so
//!    each chained sub-command is matched on its own.
//! 3. **Substitutions** — the bodies of `$(...)` and backtick regions, which
//!    execute regardless of any quoting around them.
//!
//! The tokenizer is a purpose-built state machine, not a shell parser: it
//! tracks quote state, double-quote escapes, and parenthesis depth, and
//! nothing else. Ambiguity degrades toward matching more text, never less.

use memchr::{memchr2, memchr3};
use smallvec::SmallVec;
use std::borrow::Cow;

/// Segment lists are small; four covers almost every real command line.
pub type Segments<'a> = SmallVec<[&'a str; 4]>;

/// Returns true when `command` contains no quoting, chaining, or substitution
/// metacharacters, i.e. all three views are trivial.
#[must_use]
pub fn is_plain(command: &str) -> bool {
    let bytes = command.as_bytes();
    memchr3(b'\'', b'"', b'`', bytes).is_none()
        && memchr3(b';', b'|', b'&', bytes).is_none()
        && memchr2(b'$', b'(', bytes).is_none()
}

/// Tokenizer states shared by the stripping and splitting passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    /// Unquoted text.
    Normal,
    /// Inside single quotes; no escapes, ends at the next `'`.
    Single,
    /// Inside double quotes; `\x` escapes one character.
    Double,
    /// After a backslash in unquoted text.
    EscapeNormal,
    /// After a backslash inside double quotes.
    EscapeDouble,
}

/// Produce the stripped view: quoted regions removed, delimiters elided.
///
/// Single quotes disable escape interpretation; double quotes honor `\x` as a
/// one-character escape (so `\"` does not terminate the region). An unclosed
/// quote consumes to end of string.
///
/// Returns `Cow::Borrowed` when the command contains no quote characters.
#[must_use]
pub fn strip_quotes(command: &str) -> Cow<'_, str> {
    if memchr2(b'\'', b'"', command.as_bytes()).is_none() {
        return Cow::Borrowed(command);
    }

    let mut out = String::with_capacity(command.len());
    let mut state = QuoteState::Normal;

    for ch in command.chars() {
        match state {
            QuoteState::Normal => match ch {
                '\'' => state = QuoteState::Single,
                '"' => state = QuoteState::Double,
                '\\' => {
                    out.push(ch);
                    state = QuoteState::EscapeNormal;
                }
                _ => out.push(ch),
            },
            QuoteState::EscapeNormal => {
                out.push(ch);
                state = QuoteState::Normal;
            }
            QuoteState::Single => {
                if ch == '\'' {
                    state = QuoteState::Normal;
                }
            }
            QuoteState::Double => match ch {
                '"' => state = QuoteState::Normal,
                '\\' => state = QuoteState::EscapeDouble,
                _ => {}
            },
            QuoteState::EscapeDouble => state = QuoteState::Double,
        }
    }

    Cow::Owned(out)
}

/// Split a command at top-level `&&`, `||`, `;`, and `|`.
///
/// Splitting is suppressed inside single- or double-quoted text and while
/// parenthesis depth (from `(...)` or `$(...)`) is positive. Segments are
/// trimmed; empty segments are dropped. The caller strips each segment
/// before matching.
#[must_use]
pub fn split_segments(command: &str) -> Segments<'_> {
    let bytes = command.as_bytes();
    let mut segments = Segments::new();
    let mut state = QuoteState::Normal;
    let mut depth: u32 = 0;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match state {
            QuoteState::Normal => match b {
                b'\'' => state = QuoteState::Single,
                b'"' => state = QuoteState::Double,
                b'\\' => state = QuoteState::EscapeNormal,
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b'&' if depth == 0 && bytes.get(i + 1) == Some(&b'&') => {
                    push_segment(&mut segments, &command[start..i]);
                    i += 2;
                    start = i;
                    continue;
                }
                b'|' if depth == 0 => {
                    push_segment(&mut segments, &command[start..i]);
                    i += if bytes.get(i + 1) == Some(&b'|') { 2 } else { 1 };
                    start = i;
                    continue;
                }
                b';' if depth == 0 => {
                    push_segment(&mut segments, &command[start..i]);
                    i += 1;
                    start = i;
                    continue;
                }
                _ => {}
            },
            QuoteState::EscapeNormal => state = QuoteState::Normal,
            QuoteState::Single => {
                if b == b'\'' {
                    state = QuoteState::Normal;
                }
            }
            QuoteState::Double => match b {
                b'"' => state = QuoteState::Normal,
                b'\\' => state = QuoteState::EscapeDouble,
                _ => {}
            },
            QuoteState::EscapeDouble => state = QuoteState::Double,
        }
        i += 1;
    }

    push_segment(&mut segments, &command[start..]);
    segments
}

fn push_segment<'a>(segments: &mut Segments<'a>, raw: &'a str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed);
    }
}

/// Extract every `$(...)` body (including nested occurrences) and every
/// backtick-delimited region.
///
/// `$(...)` bodies are captured with balanced parentheses: for
/// `$(a $(b))` this yields both `a $(b)` and `b`. Backticks do not nest; an
/// unpaired trailing backtick yields no region. Substitution bodies are
/// matched without quote stripping.
#[must_use]
pub fn extract_substitutions(command: &str) -> Vec<&str> {
    let bytes = command.as_bytes();
    let mut found = Vec::new();

    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'(' {
            let mut depth = 1u32;
            let mut j = i + 2;
            while j < bytes.len() {
                match bytes[j] {
                    b'(' => depth += 1,
                    b')' => {
                        depth -= 1;
                        if depth == 0 {
                            found.push(&command[i + 2..j]);
                            break;
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            // Unbalanced parentheses: no region.
        }
        i += 1;
    }

    let mut tick = 0;
    let mut open: Option<usize> = None;
    while tick < bytes.len() {
        if bytes[tick] == b'`' {
            match open.take() {
                None => open = Some(tick + 1),
                Some(start) => found.push(&command[start..tick]),
            }
        }
        tick += 1;
    }

    found
}
