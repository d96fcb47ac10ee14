//! Supervised port forwards from external ports into workspaces.
//!
//! Each `(workspace, app)` has at most one forward process. The supervisor
//! owns every process handle; nothing else terminates them.
//!
//! Work on one key is serialized through a [`KeyLock`]. Callers that must
//! keep the port map and the running forward in step (set, remove, restore)
//! hold the lock across both.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Result, RunnerError};
use crate::portmap::ExternalPortStore;
use crate::workspace::{AppKey, WorkspaceManager};

/// How long a fresh forward must survive before it counts as started.
pub const DEFAULT_START_GRACE: Duration = Duration::from_millis(200);

/// Lines of forwarder output quoted when it exits immediately.
const LOG_TAIL_LINES: usize = 10;

/// Everything needed to start one forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub key: AppKey,
    pub external_port: u16,
    pub internal_addr: String,
    pub node_port: u16,
    pub log_path: PathBuf,
}

/// A running forward process.
#[async_trait]
pub trait ForwardProcess: Send {
    /// Whether the process is still alive.
    fn is_running(&mut self) -> bool;

    /// Stop the process and reap it.
    async fn terminate(&mut self) -> Result<()>;
}

/// Starts forward processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &ForwardSpec) -> Result<Box<dyn ForwardProcess>>;
}

/// Launches `socat TCP-LISTEN:<ext>,fork,reuseaddr TCP:<addr>:<port>`.
pub struct SocatLauncher {
    program: String,
    start_grace: Duration,
}

impl SocatLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            start_grace: DEFAULT_START_GRACE,
        }
    }

    #[must_use]
    pub fn with_start_grace(mut self, grace: Duration) -> Self {
        self.start_grace = grace;
        self
    }

    fn error(&self, message: impl Into<String>) -> RunnerError {
        RunnerError::external(&self.program, message)
    }
}

struct ChildForward {
    child: Child,
}

#[async_trait]
impl ForwardProcess for ChildForward {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.is_running() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Launcher for SocatLauncher {
    async fn launch(&self, spec: &ForwardSpec) -> Result<Box<dyn ForwardProcess>> {
        if let Some(dir) = spec.log_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .await?;
        let log_stderr = log.try_clone().await?;

        let mut child = Command::new(&self.program)
            .arg(format!("TCP-LISTEN:{},fork,reuseaddr", spec.external_port))
            .arg(format!("TCP:{}:{}", spec.internal_addr, spec.node_port))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.into_std().await))
            .stderr(Stdio::from(log_stderr.into_std().await))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.error(e.to_string()))?;

        tokio::time::sleep(self.start_grace).await;

        if let Ok(Some(status)) = child.try_wait() {
            let output = tokio::fs::read_to_string(&spec.log_path)
                .await
                .unwrap_or_default();
            let lines: Vec<&str> = output.lines().collect();
            let tail = lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n");
            return Err(self.error(format!("exited immediately with {status}: {tail}")));
        }

        Ok(Box::new(ChildForward { child }))
    }
}

/// Result of [`ForwardSupervisor::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnsureOutcome {
    /// A live forward on the requested port already existed.
    Unchanged,
    Started,
    /// A previous forward for the key was stopped first.
    Restarted { previous_port: u16 },
}

/// Point-in-time view of one forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardSummary {
    pub workspace: String,
    pub app: String,
    pub external_port: u16,
    pub internal_addr: String,
    pub node_port: u16,
    pub running: bool,
    pub started_at: DateTime<Utc>,
}

struct Forward {
    spec: ForwardSpec,
    process: Box<dyn ForwardProcess>,
    started_at: DateTime<Utc>,
}

impl Forward {
    async fn stop(mut self) {
        if let Err(e) = self.process.terminate().await {
            warn!(
                workspace = %self.spec.key.workspace,
                app = %self.spec.key.app,
                error = %e,
                "Failed to stop forward"
            );
        }
    }
}

/// Exclusive hold on one key's forward, from [`ForwardSupervisor::lock`].
pub struct KeyLock {
    key: AppKey,
    _guard: OwnedMutexGuard<()>,
}

impl KeyLock {
    pub fn key(&self) -> &AppKey {
        &self.key
    }
}

/// Owns the forward processes, one per `(workspace, app)`.
pub struct ForwardSupervisor {
    workspaces: Arc<WorkspaceManager>,
    launcher: Arc<dyn Launcher>,
    log_dir: PathBuf,
    forwards: Mutex<HashMap<AppKey, Forward>>,
    key_locks: std::sync::Mutex<HashMap<AppKey, Arc<Mutex<()>>>>,
}

impl ForwardSupervisor {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        launcher: Arc<dyn Launcher>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workspaces,
            launcher,
            log_dir: log_dir.into(),
            forwards: Mutex::new(HashMap::new()),
            key_locks: std::sync::Mutex::default(),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &AppKey) -> KeyLock {
        let slot = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        KeyLock {
            key: key.clone(),
            _guard: slot.lock_owned().await,
        }
    }

    fn log_path(&self, key: &AppKey) -> PathBuf {
        self.log_dir
            .join(format!("{}__{}.log", key.workspace, key.app))
    }

    /// Make sure `key` is forwarded from `external_port`.
    ///
    /// A live forward on the same port is left alone. A forward on another
    /// port, or one whose process has exited, is replaced.
    pub async fn ensure(&self, key: &AppKey, external_port: u16) -> Result<EnsureOutcome> {
        let held = self.lock(key).await;
        self.ensure_held(&held, external_port).await
    }

    /// [`Self::ensure`] for a key the caller already holds.
    pub async fn ensure_held(&self, held: &KeyLock, external_port: u16) -> Result<EnsureOutcome> {
        let key = held.key();
        let previous = {
            let mut forwards = self.forwards.lock().await;
            let reusable = forwards
                .get_mut(key)
                .is_some_and(|f| f.spec.external_port == external_port && f.process.is_running());
            if reusable {
                debug!(workspace = %key.workspace, app = %key.app, port = external_port, "Forward already running");
                return Ok(EnsureOutcome::Unchanged);
            }
            forwards.remove(key)
        };

        let previous_port = match previous {
            Some(old) => {
                let port = old.spec.external_port;
                old.stop().await;
                Some(port)
            }
            None => None,
        };

        let kubectl = self.workspaces.kubectl_for(&key.workspace);
        let node_port = kubectl.service_node_port(&key.workspace, &key.app).await?;
        let internal_addr = self.workspaces.internal_address(&key.workspace).await?;

        let spec = ForwardSpec {
            key: key.clone(),
            external_port,
            internal_addr,
            node_port,
            log_path: self.log_path(key),
        };
        let process = self.launcher.launch(&spec).await?;
        info!(
            workspace = %key.workspace,
            app = %key.app,
            port = external_port,
            target = %format!("{}:{}", spec.internal_addr, spec.node_port),
            "Forward started"
        );

        self.forwards.lock().await.insert(
            key.clone(),
            Forward {
                spec,
                process,
                started_at: Utc::now(),
            },
        );

        Ok(previous_port.map_or(EnsureOutcome::Started, |previous_port| {
            EnsureOutcome::Restarted { previous_port }
        }))
    }

    /// Rebuild forwards for every persisted entry. Failures are logged.
    ///
    /// Each entry is re-read under its key lock, so a mapping changed or
    /// removed meanwhile is followed rather than overwritten.
    pub async fn restore(&self, store: &ExternalPortStore) -> usize {
        let mut restored = 0;
        for listed in store.list().await {
            let held = self.lock(&listed.key()).await;
            let Some(entry) = store.get(&listed.workspace, &listed.app).await else {
                continue;
            };
            match self.ensure_held(&held, entry.external_port).await {
                Ok(_) => restored += 1,
                Err(e) => warn!(
                    workspace = %entry.workspace,
                    app = %entry.app,
                    port = entry.external_port,
                    error = %e,
                    "Failed to restore forward"
                ),
            }
        }
        restored
    }

    /// Stop the forward for `key`. Returns whether one existed.
    pub async fn stop(&self, key: &AppKey) -> bool {
        let held = self.lock(key).await;
        self.stop_held(&held).await
    }

    /// [`Self::stop`] for a key the caller already holds.
    pub async fn stop_held(&self, held: &KeyLock) -> bool {
        let removed = self.forwards.lock().await.remove(held.key());
        match removed {
            Some(forward) => {
                forward.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every forward of a workspace.
    pub async fn stop_workspace(&self, workspace: &str) -> usize {
        let keys: Vec<AppKey> = self
            .forwards
            .lock()
            .await
            .keys()
            .filter(|k| k.workspace == workspace)
            .cloned()
            .collect();
        let mut stopped = 0;
        for key in keys {
            if self.stop(&key).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Current forwards ordered by key.
    pub async fn snapshot(&self) -> Vec<ForwardSummary> {
        let mut forwards = self.forwards.lock().await;
        let mut summaries: Vec<ForwardSummary> = forwards
            .values_mut()
            .map(|f| ForwardSummary {
                workspace: f.spec.key.workspace.clone(),
                app: f.spec.key.app.clone(),
                external_port: f.spec.external_port,
                internal_addr: f.spec.internal_addr.clone(),
                node_port: f.spec.node_port,
                running: f.process.is_running(),
                started_at: f.started_at,
            })
            .collect();
        summaries.sort_by(|a, b| (&a.workspace, &a.app).cmp(&(&b.workspace, &b.app)));
        summaries
    }

    /// Stop everything.
    pub async fn shutdown(&self) {
        let all: Vec<Forward> = self.forwards.lock().await.drain().map(|(_, f)| f).collect();
        if !all.is_empty() {
            info!(count = all.len(), "Stopping forwards");
        }
        for forward in all {
            forward.stop().await;
        }
    }
}
