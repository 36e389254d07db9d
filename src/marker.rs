//! Command framing: the in-band marker protocol that isolates one command's
//! output from PTY noise.
//!
//! A command is never written raw to the PTY. It is wrapped with a marker
//! pair so the read loop can tell "background noise" (async output, read
//! before the start marker) apart from "this command's stdout" (read
//! between the markers), and can extract the command's exit code from the
//! end marker.

/// Legacy end marker recognized for backward compatibility with sessions
/// created before the `<id>`-keyed marker scheme.
pub const LEGACY_END_MARKER: &str = "___CMD_END_MARKER___";

/// Build the start marker literal for a given command id.
#[must_use]
pub fn start_marker(cmd_id: &str) -> String {
    format!("___CMD_START_{cmd_id}___")
}

/// Build the end marker literal (without the trailing exit code) for a
/// given command id.
#[must_use]
pub fn end_marker(cmd_id: &str) -> String {
    format!("___CMD_END_{cmd_id}___")
}

/// Escape a command for embedding inside a single-quoted shell string:
/// every `'` becomes `'\''`.
#[must_use]
pub fn escape_single_quotes(command: &str) -> String {
    command.replace('\'', r"'\''")
}

/// Wrap a command in the marker protocol:
///
/// ```text
/// echo '___CMD_START_<C>___'; sh -c 'trap "" SIGTTOU; <escaped_command>'; echo '___CMD_END_<C>___'$?
/// ```
#[must_use]
pub fn wrap_command(command: &str, cmd_id: &str) -> String {
    let escaped = escape_single_quotes(command);
    format!(
        "echo '{start}'; sh -c 'trap \"\" SIGTTOU; {escaped}'; echo '{end}'$?\n",
        start = start_marker(cmd_id),
        end = end_marker(cmd_id),
    )
}

/// Normalize CRLF and bare CR to LF.
#[must_use]
pub fn normalize_newlines(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

/// Heuristic match for a line that is only a shell prompt under the core's
/// own deterministic `$ ` prompt.
#[must_use]
pub fn is_blank_prompt_line(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed == "$" || trimmed == "$ "
}

/// Find the first line-anchored occurrence of `marker` in `buf`: a match
/// "counts" only when it begins the buffer or is immediately preceded by a
/// `\n`. A start marker never matches inside the `echo` command that emits
/// it, since that occurrence is preceded by `echo '`, not a newline.
#[must_use]
pub fn find_line_anchored(buf: &[u8], marker: &str) -> Option<usize> {
    let marker_bytes = marker.as_bytes();
    if marker_bytes.is_empty() {
        return None;
    }
    let mut search_from = 0;
    while let Some(rel_pos) = find_subslice(&buf[search_from..], marker_bytes) {
        let pos = search_from + rel_pos;
        if pos == 0 || buf[pos - 1] == b'\n' {
            return Some(pos);
        }
        search_from = pos + 1;
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Which end-marker form matched: the per-command form, or the legacy
/// fixed form kept for replay compatibility with older sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndMarkerKind {
    Keyed,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndMarkerMatch {
    pub kind: EndMarkerKind,
    /// Byte offset where the marker text begins.
    pub marker_start: usize,
    /// Byte offset immediately after the marker text (where exit-code
    /// digits begin).
    pub after_marker: usize,
}

/// Locate the end marker anywhere in `buf` (not line-anchored): exit-code
/// extraction must work even when a command's own output has no trailing
/// newline before the marker (e.g. `000___CMD_END_<C>___7`). The
/// per-command marker is preferred; the legacy fixed marker is checked as a
/// fallback for replay of older sessions.
#[must_use]
pub fn find_end_marker(buf: &[u8], cmd_id: &str) -> Option<EndMarkerMatch> {
    let keyed = end_marker(cmd_id);
    if let Some(pos) = find_subslice(buf, keyed.as_bytes()) {
        return Some(EndMarkerMatch {
            kind: EndMarkerKind::Keyed,
            marker_start: pos,
            after_marker: pos + keyed.len(),
        });
    }
    find_subslice(buf, LEGACY_END_MARKER.as_bytes()).map(|pos| EndMarkerMatch {
        kind: EndMarkerKind::Legacy,
        marker_start: pos,
        after_marker: pos + LEGACY_END_MARKER.len(),
    })
}

/// Parse a leading run of exit-code digits (optionally negative) from the
/// bytes immediately following an end marker. Does not require a trailing
/// newline, only a non-empty digit run.
#[must_use]
pub fn extract_exit_code(tail: &[u8]) -> Option<i32> {
    let negative = tail.first() == Some(&b'-');
    let digits_start = if negative { 1 } else { 0 };
    let mut end = digits_start;
    while end < tail.len() && tail[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return None;
    }
    std::str::from_utf8(&tail[..end]).ok()?.parse().ok()
}

/// Result of parsing one command's framed output out of the accumulated
/// read buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    /// Bytes read before the start marker: background noise, not this
    /// command's output.
    pub async_output: Vec<u8>,
    /// Bytes between the start and end markers: this command's output.
    pub stdout: Vec<u8>,
    /// Exit code, once the command has completed.
    pub exit_code: Option<i32>,
    /// Whether the end marker (with a fully-terminated exit code) was
    /// observed.
    pub complete: bool,
    /// Whether the start marker has been observed yet.
    pub started: bool,
}

/// Parse the accumulated buffer for one command's marker-framed output.
/// Safe to call repeatedly as more bytes arrive -- it is a pure function of
/// the whole buffer, not an incremental state machine.
///
/// Completion requires the exit-code digit run to be followed by a
/// terminating byte (the live read loop relies on `echo`'s trailing
/// newline); a digit run that reaches the end of the buffer with no
/// terminator is treated as not-yet-complete, since more digits could
/// still arrive on the wire.
#[must_use]
pub fn parse_marked_output(buf: &[u8], cmd_id: &str) -> ParsedOutput {
    let start = find_line_anchored(buf, &start_marker(cmd_id));
    let Some(start_pos) = start else {
        return ParsedOutput {
            async_output: buf.to_vec(),
            stdout: Vec::new(),
            exit_code: None,
            complete: false,
            started: false,
        };
    };

    let async_output = buf[..start_pos].to_vec();
    let after_start = start_pos + start_marker(cmd_id).len();
    let rest = &buf[after_start..];

    match find_end_marker(rest, cmd_id) {
        Some(end_match) => {
            let stdout = rest[..end_match.marker_start].to_vec();
            let tail = &rest[end_match.after_marker..];
            let digit_run_len = tail.iter().take_while(|b| b.is_ascii_digit()).count();
            let has_terminator = digit_run_len > 0 && digit_run_len < tail.len();
            if has_terminator {
                ParsedOutput {
                    async_output,
                    stdout,
                    exit_code: extract_exit_code(tail),
                    complete: true,
                    started: true,
                }
            } else {
                ParsedOutput {
                    async_output,
                    stdout: rest.to_vec(),
                    exit_code: None,
                    complete: false,
                    started: true,
                }
            }
        }
        None => ParsedOutput {
            async_output,
            stdout: rest.to_vec(),
            exit_code: None,
            complete: false,
            started: true,
        },
    }
}

/// Interpret raw escape sequences accepted by `send_raw`:
/// `\n \r \t \\ \e`, `\xNN` (hex), `\NNN` (three-digit octal, each 0-7),
/// unknown escapes pass through literally, and a trailing lone backslash
/// passes through.
#[must_use]
pub fn interpret_escape_sequences(input: &str) -> Vec<u8> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(chars[i].encode_utf8(&mut buf).as_bytes());
            i += 1;
            continue;
        }

        // We're at a backslash; see what follows.
        if i + 1 >= chars.len() {
            // Trailing lone backslash passes through.
            out.push(b'\\');
            i += 1;
            continue;
        }

        match chars[i + 1] {
            'n' => {
                out.push(b'\n');
                i += 2;
            }
            'r' => {
                out.push(b'\r');
                i += 2;
            }
            't' => {
                out.push(b'\t');
                i += 2;
            }
            '\\' => {
                out.push(b'\\');
                i += 2;
            }
            'e' => {
                out.push(0x1b);
                i += 2;
            }
            'x' if i + 3 < chars.len() && is_hex(chars[i + 2]) && is_hex(chars[i + 3]) => {
                let hex: String = chars[i + 2..i + 4].iter().collect();
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    out.push(byte);
                }
                i += 4;
            }
            c if is_octal(c)
                && i + 3 < chars.len()
                && is_octal(chars[i + 2])
                && is_octal(chars[i + 3]) =>
            {
                let octal: String = chars[i + 1..i + 4].iter().collect();
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    out.push(byte);
                }
                i += 4;
            }
            other => {
                // Unknown escape: pass through literally, backslash included.
                out.push(b'\\');
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                i += 2;
            }
        }
    }
    out
}

fn is_hex(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn is_octal(c: char) -> bool {
    ('0'..='7').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_contains_exactly_one_start_and_end_marker_and_no_unescaped_quote() {
        let cmd = "echo 'hi there' && echo done";
        let cmd_id = "deadbeef";
        let wrapped = wrap_command(cmd, cmd_id);

        let start_lit = format!("'{}'", start_marker(cmd_id));
        let end_lit = format!("'{}'", end_marker(cmd_id));
        assert_eq!(wrapped.matches(&start_lit).count(), 1);
        assert_eq!(wrapped.matches(&end_lit).count(), 1);

        // No single quote from the original command is left unescaped: every
        // quote from `cmd` must be immediately wrapped as '\''.
        let escaped = escape_single_quotes(cmd);
        assert!(wrapped.contains(&escaped));
    }

    #[test]
    fn parse_marked_output_empty_without_start_marker() {
        let cmd_id = "aaaa1111";
        let buf = b"some unrelated noise\nmore noise\n";
        let parsed = parse_marked_output(buf, cmd_id);
        assert!(parsed.stdout.is_empty());
        assert!(!parsed.complete);
    }

    #[test]
    fn parse_marked_output_rejects_start_marker_mid_line() {
        // Simulates the echo command itself being echoed back by a
        // non-raw-mode shell: the marker text appears, but not at the start
        // of a line.
        let cmd_id = "bbbb2222";
        let buf = format!("echo '{}'\n", start_marker(cmd_id));
        let parsed = parse_marked_output(buf.as_bytes(), cmd_id);
        assert!(!parsed.started);
    }

    #[test]
    fn parse_marked_output_full_roundtrip() {
        let cmd_id = "cccc3333";
        let buf = format!(
            "background job done\n{}\nhello\n{}0\n",
            start_marker(cmd_id),
            end_marker(cmd_id)
        );
        let parsed = parse_marked_output(buf.as_bytes(), cmd_id);
        assert_eq!(parsed.async_output, b"background job done\n");
        assert_eq!(parsed.stdout, b"hello\n");
        assert_eq!(parsed.exit_code, Some(0));
        assert!(parsed.complete);
    }

    #[test]
    fn extract_exit_code_handles_legacy_and_keyed_forms() {
        assert_eq!(extract_exit_code(b"7"), Some(7));
        assert_eq!(extract_exit_code(b"42 trailing junk"), Some(42));
        assert_eq!(extract_exit_code(b""), None);
        assert_eq!(extract_exit_code(b"-1"), Some(-1));
    }

    #[test]
    fn extract_exit_code_mid_line_http_tool_example() {
        let cmd_id = "dddd4444";
        let full = format!("000{}7", end_marker(cmd_id));
        let end_match = find_end_marker(full.as_bytes(), cmd_id).unwrap();
        let tail = &full.as_bytes()[end_match.after_marker..];
        assert_eq!(extract_exit_code(tail), Some(7));
    }

    #[test]
    fn legacy_end_marker_still_recognized() {
        let cmd_id = "eeee5555";
        let buf = format!(
            "{}\nhi\n{}3\n",
            start_marker(cmd_id),
            LEGACY_END_MARKER
        );
        let parsed = parse_marked_output(buf.as_bytes(), cmd_id);
        assert_eq!(parsed.exit_code, Some(3));
        assert!(parsed.complete);
    }

    #[test]
    fn interpret_escape_sequences_hex_and_octal() {
        for n in 0u8..=255 {
            let hex = format!("\\x{n:02x}");
            assert_eq!(interpret_escape_sequences(&hex), vec![n], "hex {n:02x}");
        }
        for a in 0..4u8 {
            for b in 0..8u8 {
                for c in 0..8u8 {
                    let value = a * 64 + b * 8 + c;
                    if value > 255 {
                        continue;
                    }
                    let octal = format!("\\{a}{b}{c}");
                    assert_eq!(
                        interpret_escape_sequences(&octal),
                        vec![value],
                        "octal {a}{b}{c}"
                    );
                }
            }
        }
    }

    #[test]
    fn interpret_escape_sequences_common_forms() {
        assert_eq!(interpret_escape_sequences("\\n"), vec![b'\n']);
        assert_eq!(interpret_escape_sequences("\\r"), vec![b'\r']);
        assert_eq!(interpret_escape_sequences("\\t"), vec![b'\t']);
        assert_eq!(interpret_escape_sequences("\\\\"), vec![b'\\']);
        assert_eq!(interpret_escape_sequences("\\e"), vec![0x1b]);
        assert_eq!(interpret_escape_sequences("\\q"), vec![b'\\', b'q']);
        assert_eq!(interpret_escape_sequences("trailing\\"), b"trailing\\".to_vec());
    }

    #[test]
    fn normalize_newlines_collapses_crlf_and_cr() {
        assert_eq!(normalize_newlines("a\r\nb\rc\n"), "a\nb\nc\n");
    }
}
