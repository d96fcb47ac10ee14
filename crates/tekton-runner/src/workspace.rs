//! Ephemeral workspace clusters.
//!
//! A workspace is a kind cluster whose name carries [`WORKSPACE_PREFIX`]. Its
//! kubeconfig lives at `<kubeconfig_dir>/<name>.yaml` and apps deployed into
//! it use the workspace name as their namespace.

use std::path::{Path, PathBuf};

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RegistryTrust;
use crate::error::{Result, RunnerError};
use crate::kind::Kind;
use crate::kubectl::{Kubectl, PodSummary, ServiceSummary};

/// Prefix reserved for orchestrator-managed clusters.
pub const WORKSPACE_PREFIX: &str = "ws-";

/// Reject names that do not identify a managed workspace.
pub fn validate_workspace_name(name: &str) -> Result<()> {
    if name.len() <= WORKSPACE_PREFIX.len() || !name.starts_with(WORKSPACE_PREFIX) {
        return Err(RunnerError::validation(format!(
            "workspace must start with \"{WORKSPACE_PREFIX}\""
        )));
    }
    Ok(())
}

/// Composite key identifying one app inside one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AppKey {
    pub workspace: String,
    pub app: String,
}

impl AppKey {
    pub fn new(workspace: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            app: app.into(),
        }
    }
}

impl std::fmt::Display for AppKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workspace, self.app)
    }
}

/// An app exposed by a workspace, as listed by [`WorkspaceManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceApp {
    pub app: String,
    #[serde(rename = "nodePort")]
    pub node_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceSummary {
    pub workspace: String,
    pub apps: Vec<WorkspaceApp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStatus {
    pub workspace: String,
    pub pods: Vec<PodSummary>,
    pub services: Vec<ServiceSummary>,
}

/// Creates, configures, inspects and destroys workspace clusters.
pub struct WorkspaceManager {
    kind: Kind,
    kubectl: Kubectl,
    kubeconfig_dir: PathBuf,
    node_image: Option<String>,
    registry: RegistryTrust,
}

impl WorkspaceManager {
    pub fn new(
        kind: Kind,
        kubectl: Kubectl,
        kubeconfig_dir: impl Into<PathBuf>,
        node_image: Option<String>,
        registry: RegistryTrust,
    ) -> Self {
        Self {
            kind,
            kubectl,
            kubeconfig_dir: kubeconfig_dir.into(),
            node_image,
            registry,
        }
    }

    /// Where the kubeconfig for `name` is kept.
    pub fn kubeconfig_path(&self, name: &str) -> PathBuf {
        self.kubeconfig_dir.join(format!("{name}.yaml"))
    }

    /// kubectl bound to the workspace's kubeconfig.
    pub fn kubectl_for(&self, name: &str) -> Kubectl {
        self.kubectl.with_kubeconfig(self.kubeconfig_path(name))
    }

    /// Make sure the workspace cluster exists and is usable.
    ///
    /// Every step is idempotent, so a failed call can simply be repeated.
    /// Node configuration runs even for reused clusters, which may predate
    /// the current registry settings. Returns the kubeconfig path.
    pub async fn ensure(&self, name: &str) -> Result<PathBuf> {
        validate_workspace_name(name)?;

        let existing = self.kind.clusters().await?;
        if existing.iter().any(|c| c == name) {
            debug!(workspace = %name, "Reusing workspace cluster");
        } else {
            info!(workspace = %name, "Creating workspace cluster");
            self.kind.create(name, self.node_image.as_deref()).await?;
        }

        self.kind.node_exec(name, &self.registry_script()).await?;

        let kubeconfig = self.kind.kubeconfig(name).await?;
        let path = self.kubeconfig_path(name);
        write_private(&path, &kubeconfig).await?;
        info!(workspace = %name, kubeconfig = %path.display(), "Workspace ready");
        Ok(path)
    }

    /// Shell script trusting the registry inside the node.
    ///
    /// Writes a containerd `hosts.toml` that skips TLS verification for the
    /// registry and, when an address is configured, pins the registry
    /// hostname in `/etc/hosts`.
    pub fn registry_script(&self) -> String {
        let host = &self.registry.host;
        let mut script = format!(
            "mkdir -p /etc/containerd/certs.d/{host} && \
             printf 'server = \"https://{host}\"\\n\\n[host.\"https://{host}\"]\\n  capabilities = [\"pull\", \"resolve\"]\\n  skip_verify = true\\n' \
             > /etc/containerd/certs.d/{host}/hosts.toml"
        );
        if let Some(ip) = &self.registry.ip {
            let hostname = self.registry.hostname();
            script.push_str(&format!(
                " && (grep -q ' {hostname}$' /etc/hosts || echo '{ip} {hostname}' >> /etc/hosts)"
            ));
        }
        script
    }

    /// Address at which the workspace's node ports are reachable from the host.
    ///
    /// Prefers the node's InternalIP as reported by the cluster and falls back
    /// to the node container's network address.
    pub async fn internal_address(&self, name: &str) -> Result<String> {
        match self.kubectl_for(name).node_internal_ip().await {
            Ok(ip) if !ip.is_empty() => return Ok(ip),
            Ok(_) => debug!(workspace = %name, "Node reported no InternalIP"),
            Err(e) => debug!(workspace = %name, error = %e, "Could not read node address"),
        }
        let addr = self.kind.node_address(name).await?;
        if addr.is_empty() {
            return Err(RunnerError::NotFound(format!(
                "no reachable address for workspace {name}"
            )));
        }
        Ok(addr)
    }

    /// All managed workspaces with the apps they expose.
    ///
    /// A workspace whose services cannot be read is listed without apps.
    pub async fn list(&self) -> Result<Vec<WorkspaceSummary>> {
        let names: Vec<String> = self
            .kind
            .clusters()
            .await?
            .into_iter()
            .filter(|c| c.starts_with(WORKSPACE_PREFIX))
            .collect();

        let lookups = names.iter().map(|name| async move {
            let apps = match self.kubectl_for(name).services(name).await {
                Ok(services) => services
                    .into_iter()
                    .map(|s| WorkspaceApp {
                        app: s.name,
                        node_port: s.node_port,
                    })
                    .collect(),
                Err(e) => {
                    warn!(workspace = %name, error = %e, "Failed to list workspace services");
                    Vec::new()
                }
            };
            WorkspaceSummary {
                workspace: name.clone(),
                apps,
            }
        });
        Ok(join_all(lookups).await)
    }

    /// Pods and services of a workspace.
    pub async fn status(&self, name: &str) -> Result<WorkspaceStatus> {
        validate_workspace_name(name)?;
        let kubectl = self.kubectl_for(name);
        let (pods, services) = futures::try_join!(kubectl.pods(name, None), kubectl.services(name))?;
        Ok(WorkspaceStatus {
            workspace: name.to_string(),
            pods,
            services,
        })
    }

    /// Delete the cluster and its kubeconfig.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        validate_workspace_name(name)?;
        info!(workspace = %name, "Deleting workspace cluster");
        self.kind.delete(name).await?;
        match tokio::fs::remove_file(self.kubeconfig_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `data` to `path` readable only by the owner.
async fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use std::sync::Arc;

    fn manager(runner: &Arc<ScriptedRunner>, dir: &Path, ip: Option<&str>) -> WorkspaceManager {
        WorkspaceManager::new(
            Kind::new(runner.clone()),
            Kubectl::new(runner.clone()),
            dir,
            None,
            RegistryTrust {
                host: "lenovo:8443".into(),
                ip: ip.map(str::to_string),
            },
        )
    }

    #[test]
    fn test_validate_workspace_name() {
        assert!(validate_workspace_name("ws-demo").is_ok());
        assert!(validate_workspace_name("demo").is_err());
        assert!(validate_workspace_name("ws-").is_err());
        assert!(validate_workspace_name("").is_err());
    }

    #[tokio::test]
    async fn test_ensure_creates_missing_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("kind", &["get", "clusters"], "ws-other\n");
        runner.on("kind", &["kubeconfig"], "apiVersion: v1\nkind: Config\n");

        let path = manager(&runner, dir.path(), None)
            .ensure("ws-demo")
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("ws-demo.yaml"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "apiVersion: v1\nkind: Config\n"
        );
        assert_eq!(runner.calls_with("kind", "create").len(), 1);
        assert_eq!(runner.calls_with("docker", "ws-demo-control-plane").len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_reuses_and_still_configures() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        // A cluster whose name merely contains the target is not a match.
        runner.on("kind", &["get", "clusters"], "ws-demo\nws-demo-old\n");

        let mgr = manager(&runner, dir.path(), None);
        mgr.ensure("ws-demo").await.unwrap();
        mgr.ensure("ws-demo").await.unwrap();

        assert!(runner.calls_with("kind", "create").is_empty());
        assert_eq!(runner.calls_with("docker", "exec").len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_aborts_on_create_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("kind", &["get", "clusters"], "");
        runner.fail("kind", &["create"], "docker daemon not running");

        let err = manager(&runner, dir.path(), None)
            .ensure("ws-demo")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "kind failed: docker daemon not running");
        assert!(runner.calls_with("docker", "exec").is_empty());
        assert!(!dir.path().join("ws-demo.yaml").exists());
    }

    #[test]
    fn test_registry_script() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());

        let plain = manager(&runner, dir.path(), None).registry_script();
        assert!(plain.contains("/etc/containerd/certs.d/lenovo:8443/hosts.toml"));
        assert!(plain.contains("skip_verify = true"));
        assert!(!plain.contains("/etc/hosts"));

        let aliased = manager(&runner, dir.path(), Some("192.168.1.20")).registry_script();
        assert!(aliased.contains("echo '192.168.1.20 lenovo' >> /etc/hosts"));
    }

    #[tokio::test]
    async fn test_internal_address_falls_back_to_container() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("kubectl", &["nodes"], "");
        runner.on("docker", &["inspect"], "172.18.0.4\n");

        let addr = manager(&runner, dir.path(), None)
            .internal_address("ws-demo")
            .await
            .unwrap();
        assert_eq!(addr, "172.18.0.4");
    }

    #[tokio::test]
    async fn test_list_only_managed_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("kind", &["get", "clusters"], "kind\nws-a\nws-b\n");
        runner.on("kubectl", &["ws-a.yaml", "svc"], "web|30080\n");
        runner.fail("kubectl", &["ws-b.yaml", "svc"], "connection refused");

        let list = manager(&runner, dir.path(), None).list().await.unwrap();
        assert_eq!(
            list,
            vec![
                WorkspaceSummary {
                    workspace: "ws-a".into(),
                    apps: vec![WorkspaceApp {
                        app: "web".into(),
                        node_port: Some(30080),
                    }],
                },
                WorkspaceSummary {
                    workspace: "ws-b".into(),
                    apps: vec![],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_removes_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let mgr = manager(&runner, dir.path(), None);
        std::fs::write(mgr.kubeconfig_path("ws-demo"), "stale").unwrap();

        mgr.destroy("ws-demo").await.unwrap();
        assert!(!mgr.kubeconfig_path("ws-demo").exists());
        // A second delete tolerates the missing file.
        mgr.destroy("ws-demo").await.unwrap();
        assert!(mgr.destroy("demo").await.is_err());
    }
}
