//! Process-wide configuration, injected at manager construction.
//!
//! Env-driven, like the rest of this crate's tunables, but collected into
//! one typed struct instead of scattered constants, since the manager owns
//! several independently-tunable knobs (session caps, timeouts, cache
//! directory).

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of sessions a single user may hold open concurrently.
pub const DEFAULT_MAX_SESSIONS_PER_USER: usize = 10;

/// Ceiling on any caller-supplied command timeout.
pub const DEFAULT_MAX_TIMEOUT_SECONDS: u64 = 3600;

/// Read-loop polling deadline.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive empty/timed-out reads before prompt classification runs.
pub const STALL_THRESHOLD: usize = 15;

/// Bytes from the end of the buffer the prompt detector will scan.
pub const PROMPT_WINDOW_BYTES: usize = 256;

/// Delay before writing a response to a password-masked prompt, so the
/// shell has time to disable echo. Must not be removed: a race remains if
/// the target disables echo later than this, but shortening or dropping
/// the delay makes that race far more likely in practice.
pub const PASSWORD_WRITE_DELAY: Duration = Duration::from_millis(100);

/// Backoff schedule for remote reconnection attempts.
pub const RECONNECT_BACKOFF: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Bound on the control-session roundtrip during force-kill.
pub const CONTROL_ROUNDTRIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variables never re-exported after a reconnection resumes a
/// session's shell state.
pub const RECONNECT_SKIP_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "PS1",
    "PROMPT_COMMAND",
    "PWD",
    "OLDPWD",
    "SHLVL",
    "_",
];

/// Top-level runtime configuration for the session manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-user concurrent session cap.
    pub max_sessions_per_user: usize,
    /// Ceiling applied to any caller-supplied `timeout_ms`.
    pub max_timeout_seconds: u64,
    /// Directory the session store file lives in.
    pub cache_dir: PathBuf,
    /// Environment variable names stripped from every spawned shell, via
    /// the `SHELLCORE_STRIP_ENV` opt-in list.
    pub stripped_env_vars: HashSet<String>,
}

impl Config {
    /// Build configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let max_sessions_per_user = std::env::var("SHELLCORE_MAX_SESSIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_SESSIONS_PER_USER);

        let max_timeout_seconds = std::env::var("SHELLCORE_MAX_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_TIMEOUT_SECONDS);

        let cache_dir = std::env::var("SHELLCORE_CACHE_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir);

        let stripped_env_vars = std::env::var("SHELLCORE_STRIP_ENV")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            max_sessions_per_user,
            max_timeout_seconds,
            cache_dir,
            stripped_env_vars,
        }
    }

    /// Full path to the session store file.
    #[must_use]
    pub fn session_store_path(&self) -> PathBuf {
        self.cache_dir.join("sessions.json")
    }

    /// Whether an environment variable should be stripped from spawned
    /// shells. Only strips vars explicitly listed; the default inherits the
    /// full parent environment.
    #[must_use]
    pub fn is_sensitive_env(&self, name: &str) -> bool {
        !self.stripped_env_vars.is_empty() && self.stripped_env_vars.contains(&name.to_uppercase())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("shellcore-mcp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let cfg = Config {
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            max_timeout_seconds: DEFAULT_MAX_TIMEOUT_SECONDS,
            cache_dir: default_cache_dir(),
            stripped_env_vars: HashSet::new(),
        };
        assert!(!cfg.is_sensitive_env("PATH"));
        assert_eq!(cfg.session_store_path().file_name().unwrap(), "sessions.json");
    }
}
