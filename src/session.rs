//! Persistent shell sessions: a PTY-backed shell, the read loop that drives
//! it, and the explicit state machine a session moves through between
//! commands.
//!
//! The read loop stalls on a bounded read deadline and falls back to a
//! Ctrl-C-then-recovery-marker sequence on timeout, built on the
//! `marker`/`prompt` modules' framing and detection so the same loop serves
//! local and remote transports identically.

use crate::config::Config;
use crate::control::ControlSession;
use crate::error::{CoreError, CoreResult};
use crate::expect::{self, Script};
use crate::marker::{self, interpret_escape_sequences};
use crate::output::clean_lines;
use crate::process;
use crate::prompt::{self, PatternKind};
use crate::pty::remote::RemoteTarget;
use crate::pty::{Pty, ReadOutcome};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Idle,
    Running,
    AwaitingInput,
    Closed,
}

/// Which shell is driving the session, for the small set of
/// shell-specific prompt-init differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
    Fish,
    Sh,
}

impl ShellKind {
    fn program(self) -> &'static str {
        match self {
            ShellKind::Bash => "/bin/bash",
            ShellKind::Zsh => "/bin/zsh",
            ShellKind::Fish => "/usr/bin/fish",
            ShellKind::Sh => "/bin/sh",
        }
    }

    /// Shell-specific invocation to disable echo, clear prompts, and
    /// enable alias expansion without sourcing user rc files.
    fn init_script(self) -> &'static str {
        match self {
            ShellKind::Bash => {
                "stty -echo\nexport PS1='' PS2='' PROMPT_COMMAND='' PAGER=cat GIT_PAGER=cat\nshopt -s expand_aliases\n"
            }
            ShellKind::Sh => "stty -echo\nexport PS1='' PS2='' PAGER=cat GIT_PAGER=cat\n",
            ShellKind::Zsh => {
                "stty -echo\nexport PS1='' PROMPT='' PAGER=cat GIT_PAGER=cat\nsetopt aliases\n"
            }
            ShellKind::Fish => "stty -echo\nset -g fish_greeting ''\nset -x PAGER cat\nset -x GIT_PAGER cat\n",
        }
    }
}

/// Result of one `exec` or `provide_input` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub state: State,
    pub stdout: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_seconds: f64,
    /// If `state == AwaitingInput`, what kind of prompt triggered it.
    pub awaiting: Option<AwaitingKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingKind {
    Password,
    Confirmation,
    HostKey,
    Interactive,
    Custom,
    Unclassified,
}

impl From<PatternKind> for AwaitingKind {
    fn from(kind: PatternKind) -> Self {
        match kind {
            PatternKind::Password => AwaitingKind::Password,
            PatternKind::Confirmation => AwaitingKind::Confirmation,
            PatternKind::HostKey => AwaitingKind::HostKey,
            PatternKind::Interactive => AwaitingKind::Interactive,
            PatternKind::Custom => AwaitingKind::Custom,
            PatternKind::ShellPrompt => AwaitingKind::Unclassified,
        }
    }
}

/// A live, interactive shell session.
pub struct Session {
    pty: Pty,
    state: State,
    shell_kind: ShellKind,
    config: Config,
    pending_cmd_id: Option<String>,
    buffer: Vec<u8>,
    created_at: Instant,
    last_active_at: Instant,
    remote_target: Option<RemoteTarget>,
    last_known_cwd: Option<String>,
    last_known_env: Option<HashMap<String, String>>,
    /// The shared control session for this session's host, and this
    /// session's pts number within it -- set once after spawn for local
    /// sessions, used by the force-kill fallback's preferred strategy
    /// (`control::ControlSession::kill_pty`). `None` until attached, and
    /// always `None` for remote sessions (Strategy A is local-only).
    control: Option<Arc<ControlSession>>,
    pts_number: Option<u32>,
}

impl Session {
    pub async fn spawn_local(
        working_directory: Option<&str>,
        shell_kind: ShellKind,
        config: Config,
    ) -> CoreResult<Self> {
        let pty = Pty::spawn_local(working_directory, &config).await?;
        let mut session = Self {
            pty,
            state: State::Idle,
            shell_kind,
            config,
            pending_cmd_id: None,
            buffer: Vec::new(),
            created_at: Instant::now(),
            last_active_at: Instant::now(),
            remote_target: None,
            last_known_cwd: working_directory.map(str::to_string),
            last_known_env: None,
            control: None,
            pts_number: None,
        };
        session.init_shell().await?;
        Ok(session)
    }

    pub async fn spawn_remote(
        target: RemoteTarget,
        shell_kind: ShellKind,
        config: Config,
    ) -> CoreResult<Self> {
        let pty = Pty::connect_remote(&target).await?;
        let mut session = Self {
            pty,
            state: State::Idle,
            shell_kind,
            config,
            pending_cmd_id: None,
            buffer: Vec::new(),
            created_at: Instant::now(),
            last_active_at: Instant::now(),
            remote_target: Some(target),
            last_known_cwd: None,
            last_known_env: None,
            control: None,
            pts_number: None,
        };
        session.init_shell().await?;
        Ok(session)
    }

    async fn init_shell(&mut self) -> CoreResult<()> {
        self.pty.write(self.shell_kind.init_script().as_bytes()).await?;
        // Drain whatever the shell prints on startup (prompt, stty echo
        // acknowledgment) with a short bounded window -- there is no
        // marker yet to read until, so this is a best-effort settle.
        let settle_deadline = Instant::now() + Duration::from_millis(500);
        let mut scratch = [0u8; 4096];
        self.pty.set_read_deadline(Duration::from_millis(100));
        while Instant::now() < settle_deadline {
            match self.pty.read(&mut scratch).await? {
                ReadOutcome::Data(_) => continue,
                ReadOutcome::TimedOut => break,
                ReadOutcome::Eof => return Err(CoreError::PtyDead("shell exited during init".into())),
            }
        }
        Ok(())
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active_at.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_remote(&self) -> bool {
        self.remote_target.is_some()
    }

    /// Connection parameters for a remote session, for persistence and
    /// diagnostics. `None` for local sessions.
    pub fn remote_target(&self) -> Option<&RemoteTarget> {
        self.remote_target.as_ref()
    }

    /// The last working directory this session is known to be in: the
    /// spawn-time `working_directory` for local sessions, or whatever was
    /// restored after the most recent reconnect.
    pub fn cwd(&self) -> Option<&str> {
        self.last_known_cwd.as_deref()
    }

    /// The local shell's PID, for sessions backed by a local PTY.
    pub fn local_pid(&self) -> Option<u32> {
        self.pty.local_pid()
    }

    /// Attach the shared control session for this session's host and the
    /// pts number the manager resolved for it, enabling the force-kill
    /// fallback's Strategy A on a subsequent timeout.
    pub fn set_control(&mut self, control: Arc<ControlSession>, pts_number: Option<u32>) {
        self.control = Some(control);
        self.pts_number = pts_number;
    }

    fn touch(&mut self) {
        self.last_active_at = Instant::now();
    }

    /// Execute a command, blocking until it completes, a prompt is
    /// detected (moving the session to `AwaitingInput`), or the caller's
    /// timeout elapses.
    pub async fn exec(
        &mut self,
        command: &str,
        timeout_seconds: Option<u64>,
    ) -> CoreResult<ExecResult> {
        if self.state == State::Closed {
            return Err(CoreError::Misuse("session is closed".to_string()));
        }
        if self.state != State::Idle {
            return Err(CoreError::Misuse(
                "session is not idle; call provide_input or interrupt first".to_string(),
            ));
        }
        if let Err(reason) = process::validate_command(command) {
            return Err(CoreError::Misuse(reason));
        }

        let cmd_id = new_cmd_id();
        let wrapped = marker::wrap_command(command, &cmd_id);
        let script = expect::select_for_command(command);
        self.write_with_reconnect(wrapped.as_bytes()).await?;
        self.state = State::Running;
        self.buffer.clear();

        let timeout = timeout_seconds
            .map(|t| t.min(self.config.max_timeout_seconds))
            .unwrap_or(self.config.max_timeout_seconds);

        self.run_read_loop(cmd_id, Duration::from_secs(timeout), script)
            .await
    }

    /// Continue a session that is `AwaitingInput`: write the response (with
    /// the password-prompt settle delay when the last detection called for
    /// it) and keep reading for the same in-flight command.
    pub async fn provide_input(
        &mut self,
        text: &str,
        timeout_seconds: Option<u64>,
    ) -> CoreResult<ExecResult> {
        if self.state != State::AwaitingInput {
            return Err(CoreError::Misuse(
                "session is not awaiting input".to_string(),
            ));
        }
        let cmd_id = self
            .pending_cmd_id
            .clone()
            .ok_or_else(|| CoreError::Misuse("no command is in flight".to_string()))?;

        // Give the shell time to flip off local echo for a masked prompt
        // before the response lands -- must not be removed even though it
        // looks like dead time.
        tokio::time::sleep(crate::config::PASSWORD_WRITE_DELAY).await;

        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\n');
        self.write_with_reconnect(&bytes).await?;
        self.state = State::Running;

        let timeout = timeout_seconds
            .map(|t| t.min(self.config.max_timeout_seconds))
            .unwrap_or(self.config.max_timeout_seconds);
        self.run_read_loop(cmd_id, Duration::from_secs(timeout), None)
            .await
    }

    /// Write raw, escape-interpreted bytes without any marker framing, and
    /// read back whatever accumulates until the output settles. Used for
    /// interactive programs that were not launched through `exec` (e.g. a
    /// full-screen editor) where there is no command boundary to wait for.
    pub async fn send_raw(&mut self, text: &str, idle_timeout_secs: u64) -> CoreResult<Vec<String>> {
        if self.state == State::Closed {
            return Err(CoreError::Misuse("session is closed".to_string()));
        }
        let bytes = interpret_escape_sequences(text);
        self.pty.write(&bytes).await?;
        self.touch();

        let idle_timeout = Duration::from_secs(idle_timeout_secs);
        let chunk_timeout = Duration::from_millis(200);
        let max_total = idle_timeout.saturating_mul(5).max(Duration::from_secs(30));

        let mut accumulated = Vec::<u8>::new();
        let mut buf = [0u8; 4096];
        let mut last_meaningful_change = Instant::now();
        let mut prev_len = 0usize;
        let start = Instant::now();
        self.pty.set_read_deadline(chunk_timeout);

        loop {
            match self.pty.read(&mut buf).await? {
                ReadOutcome::Data(n) => {
                    accumulated.extend_from_slice(&buf[..n]);
                    if accumulated.len() - prev_len > 10 {
                        last_meaningful_change = Instant::now();
                        prev_len = accumulated.len();
                    }
                }
                ReadOutcome::Eof => break,
                ReadOutcome::TimedOut => {}
            }

            if !accumulated.is_empty() && last_meaningful_change.elapsed() >= idle_timeout {
                break;
            }
            if start.elapsed() >= max_total {
                break;
            }
        }

        Ok(clean_lines(&String::from_utf8_lossy(&accumulated)))
    }

    /// Send Ctrl-C to the foreground process. Valid from `Running` or
    /// `AwaitingInput`; returns the session to `Idle` once the shell
    /// settles back to a prompt.
    pub async fn interrupt(&mut self) -> CoreResult<ExecResult> {
        if !matches!(self.state, State::Running | State::AwaitingInput) {
            return Err(CoreError::Misuse(
                "interrupt is only valid while a command is running or awaiting input".to_string(),
            ));
        }

        self.pty.interrupt().await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.pty.interrupt().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let recovery_marker = format!("__RECOVER_{}__", new_cmd_id());
        self.pty
            .write(format!("\necho '{recovery_marker}'\n").as_bytes())
            .await?;

        let mut accumulated = Vec::<u8>::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(3);
        self.pty.set_read_deadline(Duration::from_millis(100));

        while Instant::now() < deadline {
            match self.pty.read(&mut buf).await? {
                ReadOutcome::Data(n) => {
                    accumulated.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&accumulated).contains(&recovery_marker) {
                        break;
                    }
                }
                ReadOutcome::TimedOut => continue,
                ReadOutcome::Eof => {
                    self.state = State::Closed;
                    return Err(CoreError::PtyDead("pty closed during interrupt".to_string()));
                }
            }
        }

        self.state = State::Idle;
        self.pending_cmd_id = None;
        self.touch();

        Ok(ExecResult {
            state: self.state,
            stdout: String::from_utf8_lossy(&accumulated).to_string(),
            exit_code: Some(130),
            timed_out: false,
            duration_seconds: 0.0,
            awaiting: None,
        })
    }

    /// Run `env` through the marker protocol and parse `KEY=VALUE` lines.
    /// Used both as a caller-facing operation and internally before a
    /// reconnect, to snapshot what to re-export.
    pub async fn capture_env(&mut self) -> CoreResult<HashMap<String, String>> {
        let result = self.exec("env", Some(10)).await?;
        let mut env = HashMap::new();
        for line in result.stdout.lines() {
            if let Some((key, value)) = line.split_once('=') {
                env.insert(key.to_string(), value.to_string());
            }
        }
        self.last_known_env = Some(env.clone());
        Ok(env)
    }

    /// Run `alias` and parse `alias name='definition'` lines.
    pub async fn capture_aliases(&mut self) -> CoreResult<HashMap<String, String>> {
        let result = self.exec("alias", Some(10)).await?;
        let mut aliases = HashMap::new();
        for line in result.stdout.lines() {
            let Some(rest) = line.strip_prefix("alias ") else {
                continue;
            };
            if let Some((name, def)) = rest.split_once('=') {
                let def = def.trim_matches('\'').trim_matches('"');
                aliases.insert(name.to_string(), def.to_string());
            }
        }
        Ok(aliases)
    }

    /// Reconnect a remote session after the transport was confirmed broken:
    /// retry with `{1s, 2s, 4s}` backoff, then selectively re-export the
    /// last captured environment (skipping
    /// `RECONNECT_SKIP_ENV_VARS`) and restore the last known working
    /// directory.
    pub async fn reconnect(&mut self) -> CoreResult<()> {
        let Some(target) = self.remote_target.clone() else {
            return Err(CoreError::Misuse(
                "reconnect is only valid for remote sessions".to_string(),
            ));
        };

        let mut last_err = None;
        for backoff in crate::config::RECONNECT_BACKOFF {
            match Pty::connect_remote(&target).await {
                Ok(pty) => {
                    self.pty = pty;
                    self.init_shell().await?;
                    self.restore_state_after_reconnect().await?;
                    self.state = State::Idle;
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(*backoff).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CoreError::TransportBroken("reconnect exhausted all retries".to_string())
        }))
    }

    /// Write to the PTY, and on a transport-broken error for a remote
    /// session, reconnect once and retry the write before giving up.
    async fn write_with_reconnect(&mut self, bytes: &[u8]) -> CoreResult<()> {
        match self.pty.write(bytes).await {
            Ok(()) => Ok(()),
            Err(e) if self.is_remote() && is_transport_broken_error(&e) => {
                self.reconnect().await?;
                self.pty.write(bytes).await
            }
            Err(e) => Err(e),
        }
    }

    async fn restore_state_after_reconnect(&mut self) -> CoreResult<()> {
        if let Some(cwd) = self.last_known_cwd.clone() {
            let escaped = marker::escape_single_quotes(&cwd);
            self.pty
                .write(format!("cd '{escaped}'\n").as_bytes())
                .await?;
        }
        if let Some(env) = self.last_known_env.clone() {
            for (key, value) in env {
                if crate::config::RECONNECT_SKIP_ENV_VARS.contains(&key.as_str()) {
                    continue;
                }
                let escaped = marker::escape_single_quotes(&value);
                self.pty
                    .write(format!("export {key}='{escaped}'\n").as_bytes())
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn close(mut self) -> CoreResult<()> {
        self.state = State::Closed;
        self.pty.close().await
    }

    /// Drive the marker-framed read loop for one in-flight command,
    /// classifying the outcome as completion, a detected prompt (moves to
    /// `AwaitingInput`), or a timeout (interrupts and recovers, exit code
    /// 124).
    async fn run_read_loop(
        &mut self,
        cmd_id: String,
        timeout: Duration,
        script: Option<Script>,
    ) -> CoreResult<ExecResult> {
        let start = Instant::now();
        let mut stall_count = 0usize;
        let mut run_state = script.as_ref().map(expect::RunState::new);
        let mut expect_buf = Vec::<u8>::new();
        self.pty.set_read_deadline(crate::config::READ_POLL_INTERVAL);

        loop {
            if start.elapsed() >= timeout {
                return self.handle_timeout(cmd_id, start).await;
            }

            let mut chunk = [0u8; 4096];
            match self.pty.read(&mut chunk).await? {
                ReadOutcome::Eof => {
                    self.state = State::Closed;
                    return Err(CoreError::PtyDead(
                        "session shell exited unexpectedly".to_string(),
                    ));
                }
                ReadOutcome::Data(n) => {
                    stall_count = 0;
                    self.buffer.extend_from_slice(&chunk[..n]);
                    expect_buf.extend_from_slice(&chunk[..n]);

                    if let (Some(script_ref), Some(state)) = (script.as_ref(), run_state.as_mut()) {
                        if !state.is_finished() {
                            match state.feed(&expect_buf) {
                                expect::StepOutcome::Matched { step_label } => {
                                    expect_buf.clear();
                                    if let Some(action) = expect::select_action(script_ref, &step_label) {
                                        self.apply_expect_action(action).await?;
                                    }
                                }
                                expect::StepOutcome::Unexpected => expect_buf.clear(),
                                expect::StepOutcome::Pending | expect::StepOutcome::Finished => {}
                            }
                        }
                    }

                    if prompt::detect_peak_tty(&self.buffer) {
                        // A full-screen program is in the alternate
                        // screen buffer; the caller should drive it
                        // through send_raw from here.
                        return self.await_input(cmd_id, AwaitingKind::Interactive, start);
                    }

                    let parsed = marker::parse_marked_output(&self.buffer, &cmd_id);
                    if parsed.complete {
                        self.state = State::Idle;
                        self.pending_cmd_id = None;
                        self.touch();
                        let lines = clean_lines(&String::from_utf8_lossy(&parsed.stdout));
                        return Ok(ExecResult {
                            state: self.state,
                            stdout: lines.join("\n"),
                            exit_code: parsed.exit_code,
                            timed_out: false,
                            duration_seconds: start.elapsed().as_secs_f64(),
                            awaiting: None,
                        });
                    }
                }
                ReadOutcome::TimedOut => {
                    stall_count += 1;
                    if stall_count >= crate::config::STALL_THRESHOLD {
                        if let Some(detection) = prompt::detect(&self.buffer) {
                            if detection.kind != PatternKind::ShellPrompt {
                                return self.await_input(cmd_id, detection.kind.into(), start);
                            }
                        }
                        stall_count = 0;
                    }
                }
            }
        }
    }

    /// Apply a matched expect-script step: write its bytes (if any) or
    /// sleep/interrupt as the action calls for.
    async fn apply_expect_action(&mut self, action: &expect::Action) -> CoreResult<()> {
        match action {
            expect::Action::Wait(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
            expect::Action::Interrupt => self.pty.interrupt().await,
            expect::Action::Skip => Ok(()),
            expect::Action::Send(_) | expect::Action::SendRaw(_) => {
                if let Some(bytes) = action.to_bytes() {
                    self.pty.write(&bytes).await?;
                }
                Ok(())
            }
        }
    }

    fn await_input(
        &mut self,
        cmd_id: String,
        kind: AwaitingKind,
        start: Instant,
    ) -> CoreResult<ExecResult> {
        self.state = State::AwaitingInput;
        self.pending_cmd_id = Some(cmd_id.clone());
        self.touch();
        let parsed = marker::parse_marked_output(&self.buffer, &cmd_id);
        let lines = clean_lines(&String::from_utf8_lossy(&parsed.stdout));
        Ok(ExecResult {
            state: self.state,
            stdout: lines.join("\n"),
            exit_code: None,
            timed_out: false,
            duration_seconds: start.elapsed().as_secs_f64(),
            awaiting: Some(kind),
        })
    }

    /// Strategy A: ask the shared control session to `pkill -9` everything
    /// attached to this session's pts. Preferred over Strategy B's inline
    /// interrupts because it reaches a foreground process that is itself
    /// ignoring SIGINT -- a control session runs outside this session's own
    /// PTY, so it isn't affected by whatever is wedged on it. Returns
    /// `false` when no control session/pts number was attached (remote
    /// sessions, or a local session the manager never wired up) or the
    /// kill itself failed, in which case the caller falls back to Strategy
    /// B.
    async fn try_force_kill_strategy_a(&mut self) -> bool {
        let (Some(control), Some(pts_number)) = (self.control.clone(), self.pts_number) else {
            return false;
        };
        control.kill_pty(pts_number).await.is_ok()
    }

    async fn handle_timeout(&mut self, cmd_id: String, start: Instant) -> CoreResult<ExecResult> {
        if self.try_force_kill_strategy_a().await {
            if !self.pty.is_alive() {
                // The shell itself was on the killed pts and died with it;
                // there is no prompt to recover back to.
                self.state = State::Closed;
                self.pending_cmd_id = None;
                let parsed = marker::parse_marked_output(&self.buffer, &cmd_id);
                let lines = clean_lines(&String::from_utf8_lossy(&parsed.stdout));
                return Ok(ExecResult {
                    state: self.state,
                    stdout: lines.join("\n"),
                    exit_code: Some(137),
                    timed_out: true,
                    duration_seconds: start.elapsed().as_secs_f64(),
                    awaiting: None,
                });
            }
        } else {
            // Strategy B: three interrupts, since a single Ctrl-C is
            // routinely swallowed by a wedged foreground process and a
            // second one lands before the first is even processed.
            let _ = self.pty.interrupt().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = self.pty.interrupt().await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = self.pty.interrupt().await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let recovery_marker = format!("__RECOVER_{}__", new_cmd_id());
        let _ = self
            .pty
            .write(format!("\necho '{recovery_marker}'\n").as_bytes())
            .await;

        let deadline = Instant::now() + Duration::from_secs(3);
        self.pty.set_read_deadline(Duration::from_millis(100));
        while Instant::now() < deadline {
            let mut chunk = [0u8; 4096];
            match self.pty.read(&mut chunk).await {
                Ok(ReadOutcome::Data(n)) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    if String::from_utf8_lossy(&self.buffer).contains(&recovery_marker) {
                        break;
                    }
                }
                Ok(ReadOutcome::TimedOut) => continue,
                _ => break,
            }
        }

        self.state = State::Idle;
        self.pending_cmd_id = None;
        self.touch();

        let parsed = marker::parse_marked_output(&self.buffer, &cmd_id);
        let lines = clean_lines(&String::from_utf8_lossy(&parsed.stdout));
        Ok(ExecResult {
            state: self.state,
            stdout: lines.join("\n"),
            exit_code: Some(124),
            timed_out: true,
            duration_seconds: start.elapsed().as_secs_f64(),
            awaiting: None,
        })
    }
}

/// 4 random bytes, hex-encoded: the per-command marker id embedded in
/// `___CMD_START_<id>___`/`___CMD_END_<id>___`.
fn new_cmd_id() -> String {
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generate a new session id: `sess_` followed by 16 hex characters from
/// 8 cryptographically random bytes. Always server-generated, never
/// caller-supplied, and never reused.
#[must_use]
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("sess_{hex}")
}

fn is_transport_broken_error(error: &CoreError) -> bool {
    match error {
        CoreError::TransportBroken(_) => true,
        CoreError::Io(io_err) => crate::error::is_transport_broken(&io_err.to_string()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_session() -> Session {
        Session {
            pty: Pty::Fake(crate::pty::fake::FakePty::new()),
            state: State::Idle,
            shell_kind: ShellKind::Bash,
            config: Config {
                max_sessions_per_user: 10,
                max_timeout_seconds: 5,
                cache_dir: std::env::temp_dir(),
                stripped_env_vars: Default::default(),
            },
            pending_cmd_id: None,
            buffer: Vec::new(),
            created_at: Instant::now(),
            last_active_at: Instant::now(),
            remote_target: None,
            last_known_cwd: None,
            last_known_env: None,
            control: None,
            pts_number: None,
        }
    }

    #[tokio::test]
    async fn exec_rejects_dangerous_commands_without_touching_the_pty() {
        let mut session = fake_session();
        let result = session.exec(":(){ :|:& };:", Some(1)).await;
        assert!(result.is_err());
        assert_eq!(session.state(), State::Idle);
    }

    #[tokio::test]
    async fn exec_requires_idle_state() {
        let mut session = fake_session();
        session.state = State::Running;
        let result = session.exec("echo hi", Some(1)).await;
        assert!(matches!(result, Err(CoreError::Misuse(_))));
    }

    #[tokio::test]
    async fn provide_input_requires_awaiting_input_state() {
        let mut session = fake_session();
        let result = session.provide_input("secret", Some(1)).await;
        assert!(matches!(result, Err(CoreError::Misuse(_))));
    }

    #[tokio::test]
    async fn exec_completes_when_fake_pty_emits_full_marker_protocol() {
        let mut session = fake_session();
        // Pre-seed the cmd id is not known to the test, so instead drive
        // the read loop directly with a synthetic buffer+parse check,
        // mirroring what `run_read_loop` would see.
        let cmd_id = "testcmd1";
        let framed = format!(
            "{}\nhello world\n{}0\n",
            marker::start_marker(cmd_id),
            marker::end_marker(cmd_id)
        );
        let parsed = marker::parse_marked_output(framed.as_bytes(), cmd_id);
        assert!(parsed.complete);
        assert_eq!(parsed.exit_code, Some(0));
        assert_eq!(
            clean_lines(&String::from_utf8_lossy(&parsed.stdout)),
            vec!["hello world".to_string()]
        );
        // Sanity: session itself starts idle and stays idle without a
        // real PTY driving output.
        assert_eq!(session.state(), State::Idle);
    }

    #[tokio::test]
    async fn interrupt_requires_running_or_awaiting_state() {
        let mut session = fake_session();
        let result = session.interrupt().await;
        assert!(matches!(result, Err(CoreError::Misuse(_))));
    }

    #[test]
    fn awaiting_kind_maps_from_pattern_kind() {
        assert_eq!(AwaitingKind::from(PatternKind::Password), AwaitingKind::Password);
        assert_eq!(
            AwaitingKind::from(PatternKind::Confirmation),
            AwaitingKind::Confirmation
        );
        assert_eq!(
            AwaitingKind::from(PatternKind::ShellPrompt),
            AwaitingKind::Unclassified
        );
        assert_eq!(AwaitingKind::from(PatternKind::HostKey), AwaitingKind::HostKey);
        assert_eq!(
            AwaitingKind::from(PatternKind::Interactive),
            AwaitingKind::Interactive
        );
        assert_eq!(AwaitingKind::from(PatternKind::Custom), AwaitingKind::Custom);
    }
}
