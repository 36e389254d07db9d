//! Expect-script runner: a small ordered state machine for driving
//! interactive tools (`ssh-keygen`, `apt upgrade`, `npm init`) that ask a
//! fixed, predictable sequence of questions.
//!
//! Built around the same step/pattern/action shape as a typical expect-style
//! session API (`Pattern::{exact,regex,glob}`, `session.expect()`), adapted
//! to the session core's own escape-sequence vocabulary
//! (`marker::interpret_escape_sequences`) instead of a standalone send API.

use crate::marker::interpret_escape_sequences;
use regex::Regex;
use std::time::Duration;

/// What to do once a step's pattern matches.
#[derive(Debug, Clone)]
pub enum Action {
    /// Write the given text (with escape-sequence interpretation) followed
    /// by a newline, as if typed and submitted.
    Send(String),
    /// Write the given text verbatim (escape-sequence interpretation
    /// still applies, but no trailing newline is added).
    SendRaw(String),
    /// Wait before evaluating the next step, e.g. to let a slow prompt
    /// finish painting.
    Wait(Duration),
    /// Send SIGINT-equivalent (Ctrl-C) to the foreground process.
    Interrupt,
    /// Consume the match without writing anything.
    Skip,
}

impl Action {
    /// Resolve the action to the raw bytes that should be written to the
    /// PTY, if any.
    #[must_use]
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Action::Send(text) => {
                let mut bytes = interpret_escape_sequences(text);
                bytes.push(b'\n');
                Some(bytes)
            }
            Action::SendRaw(text) => Some(interpret_escape_sequences(text)),
            Action::Interrupt => Some(vec![0x03]),
            Action::Wait(_) | Action::Skip => None,
        }
    }
}

/// One step in an expect script: a pattern to wait for, and what to do
/// once it matches.
#[derive(Debug, Clone)]
pub struct Step {
    pub label: String,
    pub pattern: Regex,
    pub action: Action,
    /// If the buffer never matches this step, move on to the next step
    /// instead of stalling.
    pub optional: bool,
    /// Whether this step may match more than once in a row before
    /// advancing (e.g. `apt upgrade`'s repeated per-package confirmations).
    pub repeat: bool,
    /// Upper bound on repeated matches, if `repeat` is set. `None` means
    /// unbounded.
    pub max_repeats: Option<usize>,
}

/// An ordered expect script.
#[derive(Debug, Clone)]
pub struct Script {
    pub name: String,
    pub steps: Vec<Step>,
    /// If true, buffer content that matches none of the remaining steps
    /// (including optional ones) is a script failure rather than being
    /// left for the caller to interpret as ordinary output.
    pub fail_on_unexpected: bool,
}

/// Outcome of feeding one chunk of buffer into a running script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// No step matched yet; keep reading.
    Pending,
    /// A step matched and its action (if any) should be applied. Carries
    /// the step label for diagnostics.
    Matched { step_label: String },
    /// Every step has been consumed; the script is done.
    Finished,
    /// `fail_on_unexpected` tripped: no step (required or optional)
    /// matched, and the buffer contains content the script did not
    /// expect.
    Unexpected,
}

/// Mutable progress through a [`Script`].
pub struct RunState<'a> {
    script: &'a Script,
    step_index: usize,
    repeats_done: usize,
}

impl<'a> RunState<'a> {
    #[must_use]
    pub fn new(script: &'a Script) -> Self {
        Self {
            script,
            step_index: 0,
            repeats_done: 0,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.step_index >= self.script.steps.len()
    }

    /// Feed the latest read buffer (the full accumulated buffer since the
    /// last successful match is fine; steps match on the tail) and get
    /// back the next action to take, if any.
    pub fn feed(&mut self, buffer: &[u8]) -> StepOutcome {
        if self.is_finished() {
            return StepOutcome::Finished;
        }
        let text = String::from_utf8_lossy(buffer);

        loop {
            let Some(step) = self.script.steps.get(self.step_index) else {
                return StepOutcome::Finished;
            };

            if step.pattern.is_match(&text) {
                if step.repeat {
                    let exhausted = step
                        .max_repeats
                        .is_some_and(|max| self.repeats_done + 1 >= max);
                    self.repeats_done += 1;
                    if exhausted {
                        self.repeats_done = 0;
                        self.step_index += 1;
                    }
                } else {
                    self.step_index += 1;
                    self.repeats_done = 0;
                }
                return StepOutcome::Matched {
                    step_label: step.label.clone(),
                };
            }

            if step.optional {
                self.step_index += 1;
                self.repeats_done = 0;
                continue;
            }

            return if self.script.fail_on_unexpected {
                StepOutcome::Unexpected
            } else {
                StepOutcome::Pending
            };
        }
    }
}

/// Select the action bytes for a matched step by label. Returns `None`
/// when the step performs no write (e.g. `Wait`, `Skip`).
#[must_use]
pub fn select_action<'a>(script: &'a Script, step_label: &str) -> Option<&'a Action> {
    script
        .steps
        .iter()
        .find(|s| s.label == step_label)
        .map(|s| &s.action)
}

/// Pick the builtin script, if any, that a command about to be executed
/// should be driven through -- e.g. `npm init` asks a fixed sequence of
/// questions that `builtin::npm_init` knows how to answer. Matching is a
/// plain substring check against the command text: good enough for the
/// small, fixed set of builtin scripts, which all trigger off a single
/// well-known subcommand name.
#[must_use]
pub fn select_for_command(command: &str) -> Option<Script> {
    let trimmed = command.trim();
    if trimmed.starts_with("ssh ") || trimmed.contains(" ssh ") {
        Some(builtin::ssh_host_key_accept())
    } else if trimmed.contains("apt upgrade") || trimmed.contains("apt-get upgrade") {
        Some(builtin::apt_upgrade())
    } else if trimmed.contains("npm init") {
        Some(builtin::npm_init())
    } else {
        None
    }
}

/// Poll `read_more` for the latest accumulated buffer until `state` reports
/// a match for `step_label`, finishes, or fails with `Unexpected`, bounded
/// by `timeout`. Returns `None` on timeout. Separate from the inline
/// feed-per-chunk loop a session's own read loop runs -- this is the
/// primitive for code that wants to block on one specific step outside
/// that loop (e.g. a control command driving its own short interactive
/// exchange).
pub async fn wait_for_step<F>(
    state: &mut RunState<'_>,
    step_label: &str,
    mut read_more: F,
    timeout: Duration,
) -> Option<StepOutcome>
where
    F: FnMut() -> Vec<u8>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let buffer = read_more();
        let outcome = state.feed(&buffer);
        match &outcome {
            StepOutcome::Matched { step_label: matched } if matched == step_label => {
                return Some(outcome)
            }
            StepOutcome::Finished | StepOutcome::Unexpected => return Some(outcome),
            _ => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub mod builtin {
    use super::*;

    /// `ssh` connecting to a host for the first time: accept the host key.
    #[must_use]
    pub fn ssh_host_key_accept() -> Script {
        Script {
            name: "ssh_host_key_accept".to_string(),
            fail_on_unexpected: false,
            steps: vec![Step {
                label: "accept_host_key".to_string(),
                pattern: Regex::new(r"(?i)are you sure you want to continue connecting").unwrap(),
                action: Action::Send("yes".to_string()),
                optional: true,
                repeat: false,
                max_repeats: None,
            }],
        }
    }

    /// `apt upgrade` / `apt-get upgrade`: confirm the transaction, and
    /// answer "keep the currently-installed version" for any conffile
    /// prompts, possibly repeated across several packages.
    #[must_use]
    pub fn apt_upgrade() -> Script {
        Script {
            name: "apt_upgrade".to_string(),
            fail_on_unexpected: false,
            steps: vec![
                Step {
                    label: "confirm_transaction".to_string(),
                    pattern: Regex::new(r"Do you want to continue\?\s*\[Y/n\]").unwrap(),
                    action: Action::Send("Y".to_string()),
                    optional: true,
                    repeat: false,
                    max_repeats: None,
                },
                Step {
                    label: "conffile_prompt".to_string(),
                    pattern: Regex::new(r"\*\*\* .* \(Y/I/N/O/D/Z\) \[default=N\]").unwrap(),
                    action: Action::Send("N".to_string()),
                    optional: true,
                    repeat: true,
                    max_repeats: None,
                },
            ],
        }
    }

    /// `npm init`: accept every default by sending a bare newline for each
    /// prompt, bounded to the fixed question count `npm init` asks.
    #[must_use]
    pub fn npm_init() -> Script {
        Script {
            name: "npm_init".to_string(),
            fail_on_unexpected: false,
            steps: vec![Step {
                label: "accept_defaults".to_string(),
                pattern: Regex::new(r"^.*:\s*\([^)]*\)\s*$").unwrap(),
                action: Action::Send(String::new()),
                optional: true,
                repeat: true,
                max_repeats: Some(16),
            }],
        }
    }

    #[must_use]
    pub fn scripts() -> Vec<Script> {
        vec![ssh_host_key_accept(), apt_upgrade(), npm_init()]
    }
}
