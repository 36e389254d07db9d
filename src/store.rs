//! Durable session-store persistence: a small JSON file recording enough
//! about each session to recover it (or at least explain its loss) across a
//! process restart.
//!
//! Uses an atomic temp-file-then-rename write rather than writing the store
//! file in place, so a crash mid-write can't corrupt it.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// One session's durable record: enough to explain what the session was,
/// not enough to silently resume it unattended -- saved tunnels are
/// persisted but never auto-restored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStoreEntry {
    pub id: String,
    pub mode: SessionMode,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub key_path: Option<PathBuf>,
    pub cwd: Option<String>,
    pub tunnels: Vec<TunnelSpec>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Local,
    Ssh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// On-disk shape of the whole store file: a flat map keyed by session id.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    sessions: HashMap<String, SessionStoreEntry>,
}

/// Load the store file, if present. A missing file is not an error -- it
/// means no sessions have ever been persisted. A corrupt file is logged
/// and treated as empty; the session manager falls back to an
/// in-memory-only store on storage failure.
pub async fn load(path: &Path) -> CoreResult<Vec<SessionStoreEntry>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let file: StoreFile = serde_json::from_slice(&bytes).map_err(|e| {
                CoreError::StorageError(format!("corrupt session store at {path:?}: {e}"))
            })?;
            Ok(file.sessions.into_values().collect())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(CoreError::StorageError(format!(
            "reading session store at {path:?}: {e}"
        ))),
    }
}

/// Persist the full set of entries, replacing whatever was there before.
/// Writes to a sibling temp file and renames over the target so a crash
/// mid-write never leaves a truncated store file, and sets file mode
/// `0600` since entries may carry SSH key paths.
pub async fn save_all(path: &Path, entries: &[SessionStoreEntry]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::StorageError(format!("creating {parent:?}: {e}")))?;
    }

    let file = StoreFile {
        sessions: entries
            .iter()
            .cloned()
            .map(|entry| (entry.id.clone(), entry))
            .collect(),
    };
    let serialized = serde_json::to_vec_pretty(&file)
        .map_err(|e| CoreError::StorageError(format!("serializing session store: {e}")))?;

    let tmp_path = tmp_path_for(path);
    tokio::fs::write(&tmp_path, &serialized)
        .await
        .map_err(|e| CoreError::StorageError(format!("writing {tmp_path:?}: {e}")))?;

    set_owner_only_permissions(&tmp_path).await?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| CoreError::StorageError(format!("renaming {tmp_path:?} to {path:?}: {e}")))
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> CoreResult<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| CoreError::StorageError(format!("stat {path:?}: {e}")))?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms)
        .await
        .map_err(|e| CoreError::StorageError(format!("chmod {path:?}: {e}")))
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> CoreResult<()> {
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sessions.json".to_string());
    path.with_file_name(format!(".{file_name}.tmp"))
}
