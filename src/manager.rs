//! Session manager: owns every live session for this process, enforces
//! the per-user session cap, and persists a durable record of each session
//! so a restart can explain (if not always revive) what was running.
//!
//! Two locks rather than one: a manager-level `RwLock` over the sessions
//! map so `list` doesn't block concurrent per-session work, and a second
//! `RwLock` over control sessions shared by host.

use crate::config::Config;
use crate::control::ControlSession;
use crate::error::{CoreError, CoreResult};
use crate::pty::remote::{Auth, RemoteTarget};
use crate::session::{Session, ShellKind, State};
use crate::store::{self, SessionMode, SessionStoreEntry, TunnelSpec};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Caller-facing summary of one session, independent of its live `State`
/// internals.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: State,
    pub is_remote: bool,
    pub idle_for_seconds: f64,
    pub age_seconds: f64,
}

/// A richer per-session view for `list_detailed`, carrying the connection
/// metadata that `SessionSummary` omits.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub id: String,
    pub state: State,
    pub is_remote: bool,
    pub idle_for_seconds: f64,
    pub age_seconds: f64,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub cwd: Option<String>,
}

/// Owns every session for one logical user (the manager is constructed
/// per-user by the server layer; the session cap is per-user, not global).
pub struct SessionManager {
    config: Config,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    control_sessions: Arc<RwLock<HashMap<String, Arc<ControlSession>>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            control_sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create_local(&self, working_directory: Option<String>) -> CoreResult<SessionSummary> {
        self.check_capacity().await?;
        let mut session =
            Session::spawn_local(working_directory.as_deref(), ShellKind::Bash, self.config.clone())
                .await?;
        self.attach_control_strategy_a(&mut session).await;
        let id = crate::session::new_session_id();
        let summary = self.summarize(&id, &session);
        self.insert(id, session).await?;
        Ok(summary)
    }

    pub async fn create_remote(&self, target: RemoteTarget) -> CoreResult<SessionSummary> {
        self.check_capacity().await?;
        let session = Session::spawn_remote(target, ShellKind::Bash, self.config.clone()).await?;
        let id = crate::session::new_session_id();
        let summary = self.summarize(&id, &session);
        self.insert(id, session).await?;
        Ok(summary)
    }

    /// Attach the local control session and this session's pts number, so
    /// the force-kill fallback's preferred strategy is available on a
    /// subsequent timeout. Best-effort: a failure here just means the
    /// session falls back to Strategy B later, so it's logged and
    /// swallowed rather than surfaced to the caller.
    async fn attach_control_strategy_a(&self, session: &mut Session) {
        let Some(pid) = session.local_pid() else {
            return;
        };
        let control = match self.control_session_for("local").await {
            Ok(control) => control,
            Err(e) => {
                tracing::warn!(error = %e, "failed to get local control session for Strategy A");
                return;
            }
        };
        match control.exec(&format!("ps -o tty= -p {pid}")).await {
            Ok(out) => match parse_pts_number(&out.stdout) {
                Some(pts_number) => session.set_control(control, Some(pts_number)),
                None => tracing::warn!(pid, "could not resolve pts number for Strategy A"),
            },
            Err(e) => tracing::warn!(error = %e, pid, "failed to resolve pts number for Strategy A"),
        }
    }

    async fn check_capacity(&self) -> CoreResult<()> {
        let sessions = self.sessions.read().await;
        if sessions.len() >= self.config.max_sessions_per_user {
            return Err(CoreError::Misuse(format!(
                "too many sessions ({}/{}); close one first",
                sessions.len(),
                self.config.max_sessions_per_user
            )));
        }
        Ok(())
    }

    async fn insert(&self, id: String, session: Session) -> CoreResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(CoreError::Misuse(format!("session '{id}' already exists")));
        }
        sessions.insert(id, session);
        Ok(())
    }

    fn summarize(&self, id: &str, session: &Session) -> SessionSummary {
        SessionSummary {
            id: id.to_string(),
            state: session.state(),
            is_remote: session.is_remote(),
            idle_for_seconds: session.idle_for().as_secs_f64(),
            age_seconds: session.age().as_secs_f64(),
        }
    }

    fn detail(&self, id: &str, session: &Session) -> SessionDetail {
        let target = session.remote_target();
        SessionDetail {
            id: id.to_string(),
            state: session.state(),
            is_remote: session.is_remote(),
            idle_for_seconds: session.idle_for().as_secs_f64(),
            age_seconds: session.age().as_secs_f64(),
            host: target.map(|t| t.host.clone()),
            port: target.map(|t| t.port),
            user: target.map(|t| t.user.clone()),
            cwd: session.cwd().map(str::to_string),
        }
    }

    /// Ensure `id` is present in the live session map, reviving it from the
    /// durable store if it isn't. Double-checked locking: a cheap read-lock
    /// probe first, then a write-lock re-check (in case another task won
    /// the race) before the slow store lookup and revive.
    async fn ensure_loaded(&self, id: &str) -> CoreResult<()> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(id) {
                return Ok(());
            }
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(id) {
            return Ok(());
        }

        let entries = store::load(&self.config.session_store_path()).await?;
        let entry = entries
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;

        let session = self.revive(&entry).await?;
        sessions.insert(id.to_string(), session);
        Ok(())
    }

    /// Re-spawn a session from its durable store entry. Local sessions
    /// revive into a fresh shell at the last known cwd. Remote sessions
    /// require a persisted key path -- a session that only ever
    /// authenticated with a password cannot be revived, since passwords are
    /// never written to the store.
    async fn revive(&self, entry: &SessionStoreEntry) -> CoreResult<Session> {
        match entry.mode {
            SessionMode::Local => {
                Session::spawn_local(entry.cwd.as_deref(), ShellKind::Bash, self.config.clone()).await
            }
            SessionMode::Ssh => {
                let host = entry
                    .host
                    .clone()
                    .ok_or_else(|| CoreError::Misuse(format!("session '{}' has no host on record", entry.id)))?;
                let user = entry
                    .user
                    .clone()
                    .ok_or_else(|| CoreError::Misuse(format!("session '{}' has no user on record", entry.id)))?;
                let key_path = entry.key_path.clone().ok_or_else(|| {
                    CoreError::Misuse(format!(
                        "session '{}' cannot be revived: no key path on record (password auth is never persisted)",
                        entry.id
                    ))
                })?;
                let target = RemoteTarget {
                    host,
                    port: entry.port.unwrap_or(22),
                    user,
                    auth: Auth::KeyPath(key_path),
                };
                Session::spawn_remote(target, ShellKind::Bash, self.config.clone()).await
            }
        }
    }

    /// Look up a session, reviving it from the store first if it isn't
    /// currently live.
    pub async fn get(&self, id: &str) -> CoreResult<SessionSummary> {
        self.ensure_loaded(id).await?;
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;
        Ok(self.summarize(id, session))
    }

    pub async fn exec(
        &self,
        id: &str,
        command: &str,
        timeout_seconds: Option<u64>,
    ) -> CoreResult<crate::session::ExecResult> {
        self.ensure_loaded(id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;
        session.exec(command, timeout_seconds).await
    }

    pub async fn provide_input(
        &self,
        id: &str,
        text: &str,
        timeout_seconds: Option<u64>,
    ) -> CoreResult<crate::session::ExecResult> {
        self.ensure_loaded(id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;
        session.provide_input(text, timeout_seconds).await
    }

    pub async fn send_raw(&self, id: &str, text: &str, idle_timeout_secs: u64) -> CoreResult<Vec<String>> {
        self.ensure_loaded(id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;
        session.send_raw(text, idle_timeout_secs).await
    }

    pub async fn interrupt(&self, id: &str) -> CoreResult<crate::session::ExecResult> {
        self.ensure_loaded(id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;
        session.interrupt().await
    }

    pub async fn status(&self, id: &str) -> CoreResult<SessionSummary> {
        self.ensure_loaded(id).await?;
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;
        Ok(self.summarize(id, session))
    }

    pub async fn capture_env(&self, id: &str) -> CoreResult<HashMap<String, String>> {
        self.ensure_loaded(id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;
        session.capture_env().await
    }

    pub async fn capture_aliases(&self, id: &str) -> CoreResult<HashMap<String, String>> {
        self.ensure_loaded(id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;
        session.capture_aliases().await
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, session)| self.summarize(id, session))
            .collect()
    }

    /// Same as `list`, but with the connection metadata `SessionSummary`
    /// omits -- host, port, user, cwd.
    pub async fn list_detailed(&self) -> Vec<SessionDetail> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, session)| self.detail(id, session))
            .collect()
    }

    pub async fn close(&self, id: &str) -> CoreResult<()> {
        self.ensure_loaded(id).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .remove(id)
            .ok_or_else(|| CoreError::Misuse(format!("no session '{id}'")))?;
        session.close().await
    }

    /// Close every live session, collecting per-session results rather
    /// than failing fast -- one stuck session closing badly shouldn't
    /// block the rest from closing cleanly.
    pub async fn close_all(&self) -> Vec<(String, CoreResult<()>)> {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.close(&id).await;
            results.push((id, result));
        }
        results
    }

    /// Get (or lazily spawn) the control session shared by every user
    /// session on `host`. `host` is `"local"` for the local control session.
    pub async fn control_session_for(&self, host: &str) -> CoreResult<Arc<ControlSession>> {
        {
            let control_sessions = self.control_sessions.read().await;
            if let Some(existing) = control_sessions.get(host) {
                return Ok(existing.clone());
            }
        }

        let mut control_sessions = self.control_sessions.write().await;
        // Re-check under the write lock: another task may have created it
        // while we were waiting.
        if let Some(existing) = control_sessions.get(host) {
            return Ok(existing.clone());
        }

        let control = Arc::new(ControlSession::spawn_local(&self.config).await?);
        control_sessions.insert(host.to_string(), control.clone());
        Ok(control)
    }

    /// Persist every live session's recoverable metadata to the session
    /// store. Storage failures are logged and otherwise swallowed -- the
    /// manager keeps operating in-memory-only.
    pub async fn persist(&self) {
        let sessions = self.sessions.read().await;
        let now = Utc::now();
        let entries: Vec<SessionStoreEntry> = sessions
            .iter()
            .map(|(id, session)| {
                let target = session.remote_target();
                let created_at = chrono::Duration::from_std(session.age())
                    .map(|age| now - age)
                    .unwrap_or(now);
                let last_active_at = chrono::Duration::from_std(session.idle_for())
                    .map(|idle| now - idle)
                    .unwrap_or(now);
                SessionStoreEntry {
                    id: id.clone(),
                    mode: if session.is_remote() {
                        SessionMode::Ssh
                    } else {
                        SessionMode::Local
                    },
                    host: target.map(|t| t.host.clone()),
                    port: target.map(|t| t.port),
                    user: target.map(|t| t.user.clone()),
                    key_path: target.and_then(|t| match &t.auth {
                        Auth::KeyPath(path) => Some(path.clone()),
                        _ => None,
                    }),
                    cwd: session.cwd().map(str::to_string),
                    tunnels: Vec::<TunnelSpec>::new(),
                    created_at,
                    last_active_at,
                }
            })
            .collect();
        drop(sessions);

        if let Err(e) = store::save_all(&self.config.session_store_path(), &entries).await {
            tracing::warn!(error = %e, "failed to persist session store");
        }
    }
}

/// Parse the `pts/<N>` form `ps -o tty=` prints for a process attached to a
/// pseudo-terminal. Processes with no controlling terminal print `?`, which
/// this returns `None` for.
fn parse_pts_number(tty_output: &str) -> Option<u32> {
    tty_output.trim().strip_prefix("pts/")?.parse().ok()
}
