//! Durable map of operator-chosen external ports.
//!
//! The table is a JSON array of [`ExternalPortEntry`] kept on disk. Each
//! mutation validates, updates and persists under one lock, and persistence
//! writes a temporary file that is renamed over the table, so readers only
//! ever see a complete table.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, RunnerError};
use crate::workspace::AppKey;

/// One external port assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPortEntry {
    pub workspace: String,
    pub app: String,
    pub external_port: u16,
}

impl ExternalPortEntry {
    pub fn new(workspace: impl Into<String>, app: impl Into<String>, external_port: u16) -> Self {
        Self {
            workspace: workspace.into(),
            app: app.into(),
            external_port,
        }
    }

    pub fn key(&self) -> AppKey {
        AppKey::new(&self.workspace, &self.app)
    }

    fn matches(&self, workspace: &str, app: &str) -> bool {
        self.workspace == workspace && self.app == app
    }
}

/// File-backed, conflict-checked external port table.
pub struct ExternalPortStore {
    path: PathBuf,
    entries: Mutex<Vec<ExternalPortEntry>>,
}

impl ExternalPortStore {
    /// Open the table at `path`. A missing or empty file is an empty table.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "Loaded external port map");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of all entries ordered by workspace, then app.
    pub async fn list(&self) -> Vec<ExternalPortEntry> {
        let mut entries = self.entries.lock().await.clone();
        entries.sort_by(|a, b| (&a.workspace, &a.app).cmp(&(&b.workspace, &b.app)));
        entries
    }

    pub async fn get(&self, workspace: &str, app: &str) -> Option<ExternalPortEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.matches(workspace, app))
            .cloned()
    }

    /// Insert or replace the entry for its `(workspace, app)`.
    ///
    /// Fails with [`RunnerError::Conflict`] if another key holds the port;
    /// the table is left untouched in that case and when persisting fails.
    pub async fn upsert(&self, entry: ExternalPortEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;

        if let Some(owner) = entries
            .iter()
            .find(|e| e.external_port == entry.external_port && !e.matches(&entry.workspace, &entry.app))
        {
            return Err(RunnerError::Conflict {
                port: entry.external_port,
                workspace: owner.workspace.clone(),
                app: owner.app.clone(),
            });
        }

        let mut next = entries.clone();
        match next.iter_mut().find(|e| e.matches(&entry.workspace, &entry.app)) {
            Some(existing) => *existing = entry.clone(),
            None => next.push(entry.clone()),
        }
        self.persist(&next).await?;
        *entries = next;

        info!(
            workspace = %entry.workspace,
            app = %entry.app,
            port = entry.external_port,
            "External port mapped"
        );
        Ok(())
    }

    /// Remove the entry for `(workspace, app)`, returning it if present.
    pub async fn remove(&self, workspace: &str, app: &str) -> Result<Option<ExternalPortEntry>> {
        self.remove_where(|e| e.matches(workspace, app))
            .await
            .map(|mut removed| removed.pop())
    }

    /// Remove every entry of a workspace, returning what was removed.
    pub async fn remove_workspace(&self, workspace: &str) -> Result<Vec<ExternalPortEntry>> {
        self.remove_where(|e| e.workspace == workspace).await
    }

    async fn remove_where<F>(&self, pred: F) -> Result<Vec<ExternalPortEntry>>
    where
        F: Fn(&ExternalPortEntry) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let (removed, kept): (Vec<_>, Vec<_>) = entries.iter().cloned().partition(|e| pred(e));
        if removed.is_empty() {
            return Ok(removed);
        }
        self.persist(&kept).await?;
        *entries = kept;
        Ok(removed)
    }

    /// Write `entries` to a sibling temp file and rename it over the table.
    async fn persist(&self, entries: &[ExternalPortEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let data = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
