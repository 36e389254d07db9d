//! Local PTY transport: a pseudo-terminal on this machine, with a shell
//! attached to its slave side.
//!
//! Handles PTY allocation, resize, sensitive-env stripping, `--norc
//! --noprofile` bash, PTY-echo disabling, and PS1/PS2 clearing; the framing
//! and read-loop pieces live in `marker`/`session` so this module stays a
//! thin transport.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A locally spawned shell attached to a PTY.
pub struct LocalPty {
    child: tokio::process::Child,
    writer: pty_process::OwnedWritePty,
    reader: pty_process::OwnedReadPty,
    read_deadline: Duration,
}

impl LocalPty {
    /// Spawn `/bin/bash --norc --noprofile` on a freshly allocated PTY.
    pub async fn spawn(working_directory: Option<&str>, config: &Config) -> CoreResult<Self> {
        let (pty, pts) =
            pty_process::open().map_err(|e| CoreError::PtyDead(format!("open PTY: {e}")))?;

        pty.resize(pty_process::Size::new(24, 250))
            .map_err(|e| CoreError::PtyDead(format!("resize PTY: {e}")))?;

        let mut cmd = pty_process::Command::new("/bin/bash")
            .arg("--norc")
            .arg("--noprofile");

        for (key, _) in std::env::vars() {
            if config.is_sensitive_env(&key) {
                cmd = cmd.env_remove(&key);
            }
        }

        if let Some(dir) = working_directory {
            cmd = cmd.current_dir(dir);
        }

        let child = cmd
            .spawn(pts)
            .map_err(|e| CoreError::PtyDead(format!("spawn bash: {e}")))?;

        let (reader, writer) = pty.into_split();

        let mut local = Self {
            child,
            writer,
            reader,
            read_deadline: crate::config::READ_POLL_INTERVAL,
        };

        // Disable terminal echo so our own writes don't come back as output,
        // clear PS1/PS2 (the core emits its own framing, not a human prompt),
        // and keep pagers from blocking a tool-driven session even though
        // `isatty()` is true.
        local
            .write(
                b"stty -echo\nexport PS1='' PS2='' PROMPT_COMMAND='' PAGER=cat GIT_PAGER=cat\nshopt -s expand_aliases\n",
            )
            .await?;

        Ok(local)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> CoreResult<super::ReadOutcome> {
        match tokio::time::timeout(self.read_deadline, self.reader.read(buf)).await {
            Ok(Ok(0)) => Ok(super::ReadOutcome::Eof),
            Ok(Ok(n)) => Ok(super::ReadOutcome::Data(n)),
            Ok(Err(e)) => Err(CoreError::Io(e)),
            Err(_) => Ok(super::ReadOutcome::TimedOut),
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.writer.write_all(bytes).await.map_err(CoreError::Io)?;
        self.writer.flush().await.map_err(CoreError::Io)
    }

    /// Write a single `ETX` (Ctrl-C) byte. With the PTY's default `ISIG`
    /// line discipline this is converted into `SIGINT` for the foreground
    /// process group, leaving the shell itself alive.
    pub async fn interrupt(&mut self) -> CoreResult<()> {
        self.write(&[0x03]).await
    }

    pub fn set_read_deadline(&mut self, deadline: Duration) {
        self.read_deadline = deadline;
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the shell to exit, then drop the PTY handles (which sends
    /// `SIGHUP`) before waiting, since holding the master fd open can hang
    /// `child.wait()` indefinitely.
    pub async fn close(mut self) -> CoreResult<()> {
        let _ = self.write(b"exit\n").await;

        let LocalPty {
            mut child,
            writer,
            reader,
            ..
        } = self;
        drop(writer);
        drop(reader);

        if tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .is_err()
        {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
        }
        Ok(())
    }

    /// The PID of the shell process, used by the control session to look
    /// up the controlling tty via `ps -o tty= -p <pid>` for the
    /// `pkill -9 -t pts/<N>` force-kill strategy.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}
