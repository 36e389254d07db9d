//! PTY abstraction: a uniform read/write/interrupt/close interface over
//! whatever is actually driving the terminal.
//!
//! A tagged enum, not a trait object: a third transport beyond local and
//! remote is not anticipated, so matching depth is worth more here than
//! open polymorphism. `Fake` exists only under `#[cfg(test)]`.

pub mod local;
pub mod remote;

#[cfg(test)]
pub mod fake;

use crate::config::Config;
use crate::error::CoreResult;
use std::time::Duration;

/// What a single `read` call produced. A raw PTY read returns a length of
/// zero on EOF with no distinct signal; folding that into an explicit
/// variant here keeps callers (the read loop, tests) from having to
/// re-derive the zero-means-EOF convention at every call site.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `usize` bytes were written into the caller's buffer.
    Data(usize),
    /// The read deadline elapsed with no data.
    TimedOut,
    /// The far end closed the connection.
    Eof,
}

/// Everything that can sit behind a session: a local bash process on a
/// PTY, a shell on a remote host reached over SSH, or (tests only) a
/// scripted double.
pub enum Pty {
    Local(local::LocalPty),
    Remote(remote::RemotePty),
    #[cfg(test)]
    Fake(fake::FakePty),
}

impl Pty {
    pub async fn spawn_local(working_directory: Option<&str>, config: &Config) -> CoreResult<Self> {
        Ok(Self::Local(
            local::LocalPty::spawn(working_directory, config).await?,
        ))
    }

    pub async fn connect_remote(target: &remote::RemoteTarget) -> CoreResult<Self> {
        Ok(Self::Remote(remote::RemotePty::connect(target).await?))
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> CoreResult<ReadOutcome> {
        match self {
            Pty::Local(pty) => pty.read(buf).await,
            Pty::Remote(pty) => pty.read(buf).await,
            #[cfg(test)]
            Pty::Fake(pty) => pty.read(buf).await,
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> CoreResult<()> {
        match self {
            Pty::Local(pty) => pty.write(bytes).await,
            Pty::Remote(pty) => pty.write(bytes).await,
            #[cfg(test)]
            Pty::Fake(pty) => pty.write(bytes).await,
        }
    }

    pub async fn interrupt(&mut self) -> CoreResult<()> {
        match self {
            Pty::Local(pty) => pty.interrupt().await,
            Pty::Remote(pty) => pty.interrupt().await,
            #[cfg(test)]
            Pty::Fake(pty) => pty.interrupt().await,
        }
    }

    pub fn set_read_deadline(&mut self, deadline: Duration) {
        match self {
            Pty::Local(pty) => pty.set_read_deadline(deadline),
            Pty::Remote(pty) => pty.set_read_deadline(deadline),
            #[cfg(test)]
            Pty::Fake(pty) => pty.set_read_deadline(deadline),
        }
    }

    pub async fn close(self) -> CoreResult<()> {
        match self {
            Pty::Local(pty) => pty.close().await,
            Pty::Remote(pty) => pty.close().await,
            #[cfg(test)]
            Pty::Fake(pty) => pty.close().await,
        }
    }

    /// Whether this is a local transport that is still running its child
    /// process. Remote transports and fakes report `true`, since liveness
    /// there is only discoverable via a failed read/write.
    pub fn is_alive(&mut self) -> bool {
        match self {
            Pty::Local(pty) => pty.is_alive(),
            Pty::Remote(_) => true,
            #[cfg(test)]
            Pty::Fake(_) => true,
        }
    }

    /// The local shell process's PID, if this is a local transport. Used by
    /// the session manager to look up the controlling pts for the
    /// force-kill fallback's preferred strategy; remote and fake
    /// transports have no local process to report.
    pub fn local_pid(&self) -> Option<u32> {
        match self {
            Pty::Local(pty) => pty.pid(),
            Pty::Remote(_) => None,
            #[cfg(test)]
            Pty::Fake(_) => None,
        }
    }
}
