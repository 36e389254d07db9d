//! Deterministic in-memory PTY double used by unit tests that exercise the
//! read loop, prompt detection, and force-kill logic without spawning a
//! real shell.

use crate::error::CoreResult;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Default)]
pub struct FakePty {
    /// Chunks of bytes to hand back on successive `read` calls, in order.
    inbox: VecDeque<Vec<u8>>,
    /// Everything ever written to this fake PTY, for assertions.
    pub written: Vec<u8>,
    pub interrupts: usize,
    pub closed: bool,
    read_deadline: Duration,
}

impl FakePty {
    #[must_use]
    pub fn new() -> Self {
        Self {
            read_deadline: crate::config::READ_POLL_INTERVAL,
            ..Default::default()
        }
    }

    /// Queue a chunk to be returned by a future `read` call.
    pub fn push_chunk(&mut self, chunk: impl Into<Vec<u8>>) {
        self.inbox.push_back(chunk.into());
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> CoreResult<super::ReadOutcome> {
        match self.inbox.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(super::ReadOutcome::Data(n))
            }
            None => Ok(super::ReadOutcome::TimedOut),
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    pub async fn interrupt(&mut self) -> CoreResult<()> {
        self.interrupts += 1;
        Ok(())
    }

    pub fn set_read_deadline(&mut self, deadline: Duration) {
        self.read_deadline = deadline;
    }

    pub async fn close(mut self) -> CoreResult<()> {
        self.closed = true;
        Ok(())
    }
}
