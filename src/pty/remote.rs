//! Remote PTY transport: a shell on a remote host, reached over SSH and
//! attached to a real PTY channel so the same marker framing and prompt
//! detection work identically to the local transport.
//!
//! Built on an async SSH client (client handler + channel session,
//! `request_pty` + `request_shell`, `ChannelMsg::Data`/`ExtendedData` for
//! reads, `channel.data()` for writes) rather than a blocking `ssh2`/libssh2
//! binding, so it composes with the rest of this crate's `tokio::select!`
//! timeouts.

use crate::error::{CoreError, CoreResult};
use russh::client::{self, Handle};
use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::{ChannelId, ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;

/// How to authenticate to the remote host.
#[derive(Clone)]
pub enum Auth {
    Password(String),
    KeyPath(std::path::PathBuf),
    Agent,
}

/// Connection parameters for a remote session. Never serialized with the
/// password/key payload attached -- the session store persists only
/// `host`/`port`/`user`/`key_path`.
#[derive(Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: Auth,
}

struct NoopHandler;

impl client::Handler for NoopHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host-key verification is handled at a higher level by the expect
        // runner's `ssh_host_key_accept` script driving the interactive
        // prompt on first connect; the transport itself trusts the caller's
        // already-established target.
        Ok(true)
    }
}

/// A shell on a remote host, reached over an SSH channel with a PTY
/// attached.
pub struct RemotePty {
    handle: Handle<NoopHandler>,
    channel_id: ChannelId,
    read_deadline: Duration,
    pending: Vec<u8>,
    eof: bool,
}

impl RemotePty {
    pub async fn connect(target: &RemoteTarget) -> CoreResult<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, (target.host.as_str(), target.port), NoopHandler)
            .await
            .map_err(|e| CoreError::TransportBroken(format!("ssh connect: {e}")))?;

        Self::authenticate(&mut handle, target).await?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| CoreError::TransportBroken(format!("open session channel: {e}")))?;

        channel
            .request_pty(
                false,
                "xterm",
                250,
                24,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| CoreError::TransportBroken(format!("request_pty: {e}")))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| CoreError::TransportBroken(format!("request_shell: {e}")))?;

        let channel_id = channel.id();
        // The channel handle itself is dropped once `id()` is taken; all
        // further interaction happens through `handle` keyed by the id, so
        // reads/writes below go through `handle.channel_send/wait`.
        drop(channel);

        Ok(Self {
            handle,
            channel_id,
            read_deadline: crate::config::READ_POLL_INTERVAL,
            pending: Vec::new(),
            eof: false,
        })
    }

    async fn authenticate(handle: &mut Handle<NoopHandler>, target: &RemoteTarget) -> CoreResult<()> {
        let authenticated = match &target.auth {
            Auth::Password(password) => handle
                .authenticate_password(&target.user, password)
                .await
                .map_err(|e| CoreError::TransportBroken(format!("ssh auth: {e}")))?,
            Auth::KeyPath(path) => {
                let key_pair = keys::load_secret_key(path, None)
                    .map_err(|e| CoreError::Misuse(format!("invalid private key {path:?}: {e}")))?;
                handle
                    .authenticate_publickey(
                        &target.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key_pair), None),
                    )
                    .await
                    .map_err(|e| CoreError::TransportBroken(format!("ssh auth: {e}")))?
            }
            Auth::Agent => {
                return Err(CoreError::Misuse(
                    "ssh-agent authentication is not yet wired up".to_string(),
                ))
            }
        };

        if !authenticated.success() {
            return Err(CoreError::Misuse(format!(
                "ssh authentication rejected for {}@{}",
                target.user, target.host
            )));
        }
        Ok(())
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> CoreResult<super::ReadOutcome> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(super::ReadOutcome::Data(n));
        }
        if self.eof {
            return Ok(super::ReadOutcome::Eof);
        }

        let msg = tokio::time::timeout(self.read_deadline, self.next_channel_msg()).await;
        match msg {
            Ok(Some(ChannelMsg::Data { data })) | Ok(Some(ChannelMsg::ExtendedData { data, .. })) => {
                self.pending.extend_from_slice(&data);
                self.read(buf).await
            }
            Ok(Some(ChannelMsg::Eof)) | Ok(Some(ChannelMsg::Close)) => {
                self.eof = true;
                Ok(super::ReadOutcome::Eof)
            }
            Ok(Some(_)) => Ok(super::ReadOutcome::TimedOut),
            Ok(None) => {
                self.eof = true;
                Ok(super::ReadOutcome::Eof)
            }
            Err(_) => Ok(super::ReadOutcome::TimedOut),
        }
    }

    async fn next_channel_msg(&mut self) -> Option<ChannelMsg> {
        self.handle.wait().await
    }

    pub async fn write(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.handle
            .data(self.channel_id, bytes.to_vec().into())
            .await
            .map_err(|e| CoreError::TransportBroken(format!("ssh write: {e}")))
    }

    pub async fn interrupt(&mut self) -> CoreResult<()> {
        self.write(&[0x03]).await
    }

    pub fn set_read_deadline(&mut self, deadline: Duration) {
        self.read_deadline = deadline;
    }

    pub async fn close(mut self) -> CoreResult<()> {
        let _ = self.write(b"exit\n").await;
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        Ok(())
    }
}
