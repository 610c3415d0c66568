//! Session store: whether a user is authenticated and under which pairing id.
//!
//! A store is an explicitly constructed service handle. Clones share the same
//! state. It is written only by a successful handshake and by an explicit
//! disconnect. A store opened on a file loads its initial value from that
//! file and keeps it in sync; an in-memory store lives as long as the process.

use std::fs;
#[cfg(unix)]
use std::fs::OpenOptions;
#[cfg(unix)]
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Persisted authentication state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub authenticated: bool,
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: watch::Sender<SessionState>,
    path: Option<PathBuf>,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    /// Process-lifetime store, initially unauthenticated.
    pub fn in_memory() -> Self {
        Self::with_state(SessionState::default(), None)
    }

    /// Store bound to a session file.
    ///
    /// A missing file reads as unauthenticated.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read session from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse session from {}", path.display()))?
        } else {
            SessionState::default()
        };
        Ok(Self::with_state(state, Some(path.to_path_buf())))
    }

    fn with_state(state: SessionState, path: Option<PathBuf>) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self {
            inner: Arc::new(Inner { state: tx, path }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().authenticated
    }

    pub fn user_pairing_id(&self) -> Option<String> {
        self.inner.state.borrow().session_id.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receives every change to the session.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Records a completed handshake.
    ///
    /// The in-memory value is updated even if persisting it fails.
    pub(crate) fn establish(&self, pairing_id: &str) -> Result<()> {
        let state = SessionState {
            authenticated: true,
            session_id: Some(pairing_id.to_string()),
            connected_at: Some(Utc::now()),
        };
        self.inner.state.send_replace(state.clone());
        tracing::info!(pairing_id = %mask_id(pairing_id), "session established");

        match &self.inner.path {
            Some(path) => save(path, &state),
            None => Ok(()),
        }
    }

    /// Clears the session. Returns whether one was stored.
    ///
    /// # Errors
    /// Returns an error if the session file cannot be removed.
    pub fn disconnect(&self) -> Result<bool> {
        let previous = self.inner.state.send_replace(SessionState::default());
        if previous.authenticated {
            tracing::info!("session cleared");
        }

        if let Some(path) = &self.inner.path
            && path.exists()
        {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove session file {}", path.display()))?;
        }
        Ok(previous.authenticated)
    }
}

/// Writes the session with restricted permissions (0600) via temp file + rename.
fn save(path: &Path, state: &SessionState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let contents = serde_json::to_string_pretty(state).context("Failed to serialize session")?;
    let tmp_path = path.with_extension("json.tmp");

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)
            .with_context(|| format!("Failed to open {} for writing", tmp_path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write to {}", tmp_path.display()))?;
    }

    #[cfg(not(unix))]
    {
        fs::write(&tmp_path, contents)
            .with_context(|| format!("Failed to write to {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })
}

/// Returns a masked pairing id for display (first 8 chars + ...).
pub fn mask_id(id: &str) -> String {
    if id.chars().count() <= 12 {
        return "***".to_string();
    }
    let head: String = id.chars().take(8).collect();
    format!("{head}...")
}
