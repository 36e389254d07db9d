//! Prompt detection: deciding whether the shell is now sitting at an
//! interactive prompt, and if so what kind -- a normal command prompt, a
//! password prompt, or a yes/no confirmation.
//!
//! This is scanned only over the tail of the read buffer
//! (`config::PROMPT_WINDOW_BYTES`), since a prompt is by definition the
//! last thing written and scanning the whole accumulated buffer on every
//! poll would be wasted work on long-running commands.

use crate::config::PROMPT_WINDOW_BYTES;
use regex::Regex;
use std::sync::LazyLock;

/// What kind of prompt a pattern match represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// A normal shell prompt (`$ `, `# `, a configured custom prompt).
    ShellPrompt,
    /// A password or passphrase prompt; callers must mask the echoed
    /// response and honor `PASSWORD_WRITE_DELAY` before writing it.
    Password,
    /// A yes/no confirmation prompt.
    Confirmation,
    /// An SSH host-key fingerprint prompt. Classified separately from a
    /// generic confirmation so an expect script can auto-accept it without
    /// also swallowing unrelated yes/no prompts.
    HostKey,
    /// A full-screen or alternate-screen program has taken over the
    /// terminal (detected alongside [`detect_peak_tty`]'s own NUL-run scan).
    Interactive,
    /// A caller-registered pattern that doesn't fit any of the builtin
    /// kinds above.
    Custom,
}

/// One candidate pattern the detector tries, in priority order.
pub struct Pattern {
    pub kind: PatternKind,
    pub regex: Regex,
}

/// Patterns are tried in this order; the first match wins -- a line that
/// could be read as both a password prompt and a shell prompt is
/// classified as the password prompt. Host-key prompts are tried before the
/// generic yes/no confirmation patterns, since "are you sure you want to
/// continue connecting (yes/no)?" would otherwise match the generic form
/// first.
static BUILTIN_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        Pattern {
            kind: PatternKind::Password,
            regex: Regex::new(r"(?i)(password|passphrase)\s*:\s*$").unwrap(),
        },
        Pattern {
            kind: PatternKind::Password,
            regex: Regex::new(r"(?i)\[sudo\] password for [^:]+:\s*$").unwrap(),
        },
        Pattern {
            kind: PatternKind::HostKey,
            regex: Regex::new(r"(?i)are you sure you want to continue connecting").unwrap(),
        },
        Pattern {
            kind: PatternKind::Confirmation,
            regex: Regex::new(r"(?i)\(yes/no\)\??\s*$").unwrap(),
        },
        Pattern {
            kind: PatternKind::Confirmation,
            regex: Regex::new(r"(?i)\[y/n\]\s*$").unwrap(),
        },
        Pattern {
            kind: PatternKind::ShellPrompt,
            regex: Regex::new(r"[$#%>]\s?$").unwrap(),
        },
    ]
});

/// A successful prompt match.
#[derive(Debug, Clone)]
pub struct Detection {
    pub kind: PatternKind,
    /// The matched text, for diagnostics.
    pub matched: String,
}

/// Scan the tail of `buffer` (the last `PROMPT_WINDOW_BYTES` bytes) against
/// the builtin patterns in priority order, returning the first match.
#[must_use]
pub fn detect(buffer: &[u8]) -> Option<Detection> {
    detect_with(buffer, &BUILTIN_PATTERNS)
}

/// Same as [`detect`], but against a caller-supplied pattern set -- used by
/// sessions that register additional custom prompt patterns on top of the
/// builtins.
#[must_use]
pub fn detect_with(buffer: &[u8], patterns: &[Pattern]) -> Option<Detection> {
    let window_start = buffer.len().saturating_sub(PROMPT_WINDOW_BYTES);
    let window = &buffer[window_start..];
    let text = String::from_utf8_lossy(window);
    let lines: Vec<&str> = text.lines().rev().take(1).collect();
    let last_line = lines.first().copied().unwrap_or(&text);

    for pattern in patterns {
        if let Some(m) = pattern.regex.find(last_line) {
            return Some(Detection {
                kind: pattern.kind,
                matched: m.as_str().to_string(),
            });
        }
    }
    None
}

/// Number of consecutive NUL bytes that signals the shell has gone
/// "peak-TTY" -- typically a full-screen program (`top`, `less`, `vi`)
/// clearing the alternate screen buffer.
pub const PEAK_TTY_NUL_RUN: usize = 13;

/// Detect a run of at least [`PEAK_TTY_NUL_RUN`] consecutive NUL bytes
/// anywhere in `raw`. This is a distinct signal from [`detect`] -- it is a
/// linear byte scan over the raw (unwindowed, un-decoded) buffer, not a
/// regex match against a UTF-8 window, since NUL runs are binary noise
/// that may not appear at a text boundary.
#[must_use]
pub fn detect_peak_tty(raw: &[u8]) -> bool {
    let mut run = 0;
    for &byte in raw {
        if byte == 0 {
            run += 1;
            if run >= PEAK_TTY_NUL_RUN {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}
