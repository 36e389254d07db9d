//! Control session: a secondary PTY, one per host, shared
//! across every user session on that host, used for operations that must
//! run outside any single session's own shell state -- most importantly
//! finding and force-killing a stuck foreground process from the outside.
//!
//! Uses its own simpler marker scheme (`__CTRL_<nanos>__`) rather than the
//! per-command `___CMD_START/END_<id>___` grammar in `marker.rs`, since
//! control commands are always short, synchronous, and never need
//! async-output separation.

use crate::error::{CoreError, CoreResult};
use crate::pty::{Pty, ReadOutcome};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::Mutex;

/// Matches this module's own marker scheme regardless of the specific
/// nanosecond-keyed id a given call generated -- since every command runs
/// serialized through the control session's mutex, there is never more
/// than one outstanding marker to disambiguate.
static CTRL_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__CTRL_\d+__(-?\d+)").unwrap());

/// One control-session command's result.
#[derive(Debug, Clone)]
pub struct ControlOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// A control session for one host. Internally serializes every command
/// through its own mutex, independent of any user session's mutex.
pub struct ControlSession {
    inner: Mutex<Pty>,
}

impl ControlSession {
    pub async fn spawn_local(config: &crate::config::Config) -> CoreResult<Self> {
        let pty = Pty::spawn_local(None, config).await?;
        Ok(Self {
            inner: Mutex::new(pty),
        })
    }

    #[cfg(test)]
    pub fn from_fake(fake: crate::pty::fake::FakePty) -> Self {
        Self {
            inner: Mutex::new(Pty::Fake(fake)),
        }
    }

    /// Run a command through the control session's own marker scheme and
    /// return its captured stdout and exit code.
    pub async fn exec(&self, command: &str) -> CoreResult<ControlOutput> {
        let mut pty = self.inner.lock().await;
        let marker = format!("__CTRL_{}__", monotonic_nanos());
        let wrapped = format!("{command}; echo '{marker}'$?\n");
        pty.write(wrapped.as_bytes()).await?;

        let mut accumulated = Vec::<u8>::new();
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + crate::config::CONTROL_ROUNDTRIP_TIMEOUT;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Timeout(format!(
                    "control session command timed out: {command}"
                )));
            }
            match pty.read(&mut buf).await? {
                ReadOutcome::Data(n) => {
                    accumulated.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&accumulated);
                    if let Some(m) = CTRL_MARKER.captures(&text) {
                        let whole = m.get(0).unwrap();
                        let exit_code: i32 = m[1].parse().unwrap_or(-1);
                        let stdout = text[..whole.start()].to_string();
                        return Ok(ControlOutput { stdout, exit_code });
                    }
                }
                ReadOutcome::TimedOut => continue,
                ReadOutcome::Eof => {
                    return Err(CoreError::PtyDead(
                        "control session PTY closed unexpectedly".to_string(),
                    ))
                }
            }
        }
    }

    /// Write raw bytes with no framing, used for the force-kill fallback's
    /// interactive keystrokes (Strategy B of the force-kill fallback).
    pub async fn exec_raw(&self, bytes: &[u8]) -> CoreResult<()> {
        let mut pty = self.inner.lock().await;
        pty.write(bytes).await
    }

    /// Force-kill every process attached to the given pts device: Strategy
    /// A of the force-kill fallback.
    pub async fn kill_pty(&self, pts_number: u32) -> CoreResult<()> {
        let out = self.exec(&format!("pkill -9 -t pts/{pts_number}")).await?;
        // pkill exits 1 when it matched nothing, which is not a failure
        // here -- the pts may simply have had nothing left running on it.
        if out.exit_code != 0 && out.exit_code != 1 {
            return Err(CoreError::Misuse(format!(
                "pkill -9 -t pts/{pts_number} failed: exit {}",
                out.exit_code
            )));
        }
        Ok(())
    }

    /// List PIDs currently attached to a pts device.
    pub async fn get_pty_processes(&self, pts_number: u32) -> CoreResult<Vec<u32>> {
        let out = self
            .exec(&format!("ps -t pts/{pts_number} -o pid="))
            .await?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    pub async fn is_pty_alive(&self, pts_number: u32) -> CoreResult<bool> {
        Ok(!self.get_pty_processes(pts_number).await?.is_empty())
    }

    pub async fn kill_process(&self, pid: u32) -> CoreResult<()> {
        let out = self.exec(&format!("kill -9 {pid}")).await?;
        if out.exit_code != 0 {
            return Err(CoreError::Misuse(format!(
                "kill -9 {pid} failed: exit {}",
                out.exit_code
            )));
        }
        Ok(())
    }

    pub async fn is_process_running(&self, pid: u32) -> CoreResult<bool> {
        let out = self.exec(&format!("kill -0 {pid}")).await?;
        Ok(out.exit_code == 0)
    }
}

fn monotonic_nanos() -> u128 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos()
}

/// Test-only helper: a sleep small enough to keep async control tests fast
/// but large enough to let a fake PTY's queued chunks be consumed in
/// order.
#[cfg(test)]
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
