//! Dangerous-command blocking: a pre-execution safety net shared by every
//! session regardless of transport.
//!
//! `Session::exec` (session.rs) runs every caller-supplied command through
//! `validate_command` before it ever reaches a PTY.

use regex::Regex;
use std::sync::LazyLock;

/// System-critical paths that should never be the target of recursive delete,
/// chmod, or chown operations.
const PROTECTED_PATHS: &[&str] = &[
    "/",
    "/*",
    "/bin",
    "/sbin",
    "/usr",
    "/etc",
    "/var",
    "/home",
    "/root",
    "/lib",
    "/lib64",
    "/opt",
    "/boot",
    "/dev",
    "/sys",
    "/proc",
    "/System",
    "/Library",
    "/Applications",
    "/Users",
    "/private",
    "/private/var",
    "/private/etc",
];

/// Compiled patterns for dangerous commands. Built once, reused on every check.
static DANGEROUS_PATTERNS: LazyLock<Vec<DangerousPattern>> = LazyLock::new(|| {
    vec![
        // Fork bombs
        DangerousPattern {
            regex: Regex::new(r":\(\)\s*\{.*\|.*&\s*\}\s*;").unwrap(),
            description: "fork bomb",
        },
        // mkfs on any device
        DangerousPattern {
            regex: Regex::new(r"\bmkfs\b").unwrap(),
            description: "filesystem format (mkfs)",
        },
        // dd writing to block devices
        DangerousPattern {
            regex: Regex::new(r"\bdd\b.*\bof=/dev/").unwrap(),
            description: "raw write to block device (dd of=/dev/...)",
        },
        // Overwrite block devices via redirect
        DangerousPattern {
            regex: Regex::new(r">\s*/dev/(sd|nvme|hd|vd|xvd|disk|mapper/)").unwrap(),
            description: "redirect to block device",
        },
        // shutdown / reboot / halt / poweroff
        DangerousPattern {
            regex: Regex::new(r"\b(shutdown|reboot|halt|poweroff)\b").unwrap(),
            description: "system shutdown/reboot",
        },
        // init 0 or init 6
        DangerousPattern {
            regex: Regex::new(r"\binit\s+[06]\b").unwrap(),
            description: "system halt/reboot via init",
        },
    ]
});

struct DangerousPattern {
    regex: Regex,
    description: &'static str,
}

/// Validate a command against dangerous patterns. Returns `Ok(())` if safe,
/// or `Err(description)` if the command matches a dangerous pattern.
pub fn validate_command(command: &str) -> Result<(), String> {
    for pattern in DANGEROUS_PATTERNS.iter() {
        if pattern.regex.is_match(command) {
            return Err(format!(
                "blocked: command matches dangerous pattern ({}): {}",
                pattern.description, command
            ));
        }
    }

    check_destructive_on_protected_paths(command)?;

    Ok(())
}

/// Check if a command performs recursive destructive operations on protected paths.
fn check_destructive_on_protected_paths(command: &str) -> Result<(), String> {
    let normalized = command.trim();

    for subcmd in split_subcommands(normalized) {
        let subcmd = subcmd.trim();
        if subcmd.is_empty() {
            continue;
        }

        if is_dangerous_rm(subcmd) {
            return Err(format!(
                "blocked: recursive delete targeting a protected system path: {subcmd}"
            ));
        }

        if is_dangerous_chmod_chown(subcmd, "chmod") {
            return Err(format!(
                "blocked: recursive chmod on a protected system path: {subcmd}"
            ));
        }

        if is_dangerous_chmod_chown(subcmd, "chown") {
            return Err(format!(
                "blocked: recursive chown on a protected system path: {subcmd}"
            ));
        }
    }

    Ok(())
}

/// Split a command string on shell operators (;, &&, ||) to get individual commands.
fn split_subcommands(cmd: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut remaining = cmd;
    while !remaining.is_empty() {
        if let Some(pos) = remaining
            .find("&&")
            .into_iter()
            .chain(remaining.find("||"))
            .chain(remaining.find(';'))
            .min()
        {
            parts.push(&remaining[..pos]);
            let sep_len =
                if remaining[pos..].starts_with("&&") || remaining[pos..].starts_with("||") {
                    2
                } else {
                    1
                };
            remaining = &remaining[pos + sep_len..];
        } else {
            parts.push(remaining);
            break;
        }
    }
    parts
}

/// Check if a subcmd is a dangerous `rm` invocation targeting protected paths.
fn is_dangerous_rm(subcmd: &str) -> bool {
    let words: Vec<&str> = subcmd.split_whitespace().collect();

    let rm_pos = words.iter().position(|w| *w == "rm");
    let rm_pos = match rm_pos {
        Some(p) => p,
        None => return false,
    };

    let args = &words[rm_pos + 1..];

    let has_recursive = args.iter().any(|a| {
        *a == "-r"
            || *a == "-R"
            || *a == "--recursive"
            || a.starts_with('-') && !a.starts_with("--") && (a.contains('r') || a.contains('R'))
    });

    if !has_recursive {
        return false;
    }

    for arg in args {
        if arg.starts_with('-') {
            continue;
        }
        let path = arg.trim_end_matches('/');
        let path_with_slash = if path.is_empty() { "/" } else { path };
        for protected in PROTECTED_PATHS {
            let protected_trimmed = protected.trim_end_matches('/');
            let protected_cmp = if protected_trimmed.is_empty() {
                "/"
            } else {
                protected_trimmed
            };
            if path_with_slash == protected_cmp || *arg == "/*" {
                return true;
            }
        }
    }

    false
}

/// Check if a subcmd is a dangerous recursive chmod/chown on protected paths.
fn is_dangerous_chmod_chown(subcmd: &str, cmd_name: &str) -> bool {
    let words: Vec<&str> = subcmd.split_whitespace().collect();

    let cmd_pos = words.iter().position(|w| *w == cmd_name);
    let cmd_pos = match cmd_pos {
        Some(p) => p,
        None => return false,
    };

    let args = &words[cmd_pos + 1..];

    let has_recursive = args.iter().any(|a| {
        *a == "-R"
            || *a == "--recursive"
            || a.starts_with('-') && !a.starts_with("--") && a.contains('R')
    });

    if !has_recursive {
        return false;
    }

    for arg in args {
        if arg.starts_with('-') {
            continue;
        }
        let path = arg.trim_end_matches('/');
        let path_with_slash = if path.is_empty() { "/" } else { path };
        for protected in PROTECTED_PATHS {
            let protected_trimmed = protected.trim_end_matches('/');
            let protected_cmp = if protected_trimmed.is_empty() {
                "/"
            } else {
                protected_trimmed
            };
            if path_with_slash == protected_cmp {
                return true;
            }
        }
    }

    false
}
