//! Wires the components together behind the operations the CLI and HTTP
//! service expose.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::command::{CommandRunner, Invocation};
use crate::config::RunnerConfig;
use crate::deployer::{AppDeployer, DeployedApp};
use crate::driver::{ExecutionDriver, Submission};
use crate::endpoints::EndpointCache;
use crate::error::{Result, RunnerError};
use crate::forward::{EnsureOutcome, ForwardSummary, ForwardSupervisor, Launcher};
use crate::kind::Kind;
use crate::kubectl::{Kubectl, PodSummary, ReplicaCounts};
use crate::manifest::{Manifest, ManifestSynthesizer};
use crate::portmap::{ExternalPortEntry, ExternalPortStore};
use crate::request::{DeployRequest, RunRequest};
use crate::templates::Renderer;
use crate::waiter::CompletionWaiter;
use crate::workspace::{
    validate_workspace_name, AppKey, WorkspaceManager, WorkspaceStatus, WorkspaceSummary,
};

/// Upper bound accepted for scale requests.
pub const MAX_REPLICAS: u32 = 100;

/// A validated request and the documents it renders to.
#[derive(Debug, Clone)]
pub struct Plan {
    pub request: DeployRequest,
    pub manifests: Vec<Manifest>,
}

/// Pods, service port and replica counts of one app.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub workspace: String,
    pub app: String,
    pub pods: Vec<PodSummary>,
    pub node_port: Option<u16>,
    pub replicas: ReplicaCounts,
}

/// What a workspace delete cleaned up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceDeleted {
    pub workspace: String,
    pub forwards_stopped: usize,
    pub mappings_removed: usize,
}

/// Result of mapping an external port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapped {
    #[serde(flatten)]
    pub entry: ExternalPortEntry,
    pub forward: EnsureOutcome,
}

fn validate_replicas(replicas: u32) -> Result<()> {
    if replicas > MAX_REPLICAS {
        return Err(RunnerError::validation(format!(
            "replicas must be between 0 and {MAX_REPLICAS}"
        )));
    }
    Ok(())
}

/// Validated key for an app inside a managed workspace.
pub fn app_key(workspace: &str, app: &str) -> Result<AppKey> {
    validate_workspace_name(workspace)?;
    let app = app.trim();
    if app.is_empty() {
        return Err(RunnerError::validation("app is required"));
    }
    Ok(AppKey::new(workspace, app))
}

/// First non-loopback address from `hostname -I`, else `127.0.0.1`.
pub async fn detect_host_ip(runner: &dyn CommandRunner) -> String {
    match runner.run_checked(&Invocation::new("hostname").arg("-I")).await {
        Ok(output) => output
            .stdout_text()
            .split_whitespace()
            .find(|a| !a.starts_with("127.") && *a != "::1")
            .unwrap_or("127.0.0.1")
            .to_string(),
        Err(e) => {
            warn!(error = %e, "Host address detection failed");
            "127.0.0.1".to_string()
        }
    }
}

/// The orchestration engine.
pub struct Orchestrator {
    config: RunnerConfig,
    host_ip: String,
    synthesizer: ManifestSynthesizer,
    driver: ExecutionDriver,
    waiter: CompletionWaiter,
    workspaces: Arc<WorkspaceManager>,
    deployer: AppDeployer,
    endpoints: Arc<EndpointCache>,
    store: ExternalPortStore,
    forwards: ForwardSupervisor,
}

impl Orchestrator {
    /// Build the engine and load the persisted port map.
    ///
    /// The host address is resolved once here; app endpoints and
    /// [`Self::host_ip`] both use it.
    pub async fn new(
        config: RunnerConfig,
        runner: Arc<dyn CommandRunner>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        let renderer = Arc::new(Renderer::new()?);
        let kubectl = Kubectl::new(Arc::clone(&runner));
        let workspaces = Arc::new(WorkspaceManager::new(
            Kind::new(Arc::clone(&runner)),
            kubectl.clone(),
            config.kubeconfig_dir.clone(),
            config.node_image.clone(),
            config.registry.clone(),
        ));
        let host_ip = match &config.host_ip {
            Some(ip) => ip.clone(),
            None => detect_host_ip(runner.as_ref()).await,
        };
        info!(host_ip = %host_ip, "Using host address");
        let endpoints = Arc::new(EndpointCache::new(&host_ip));
        let store = ExternalPortStore::load(config.external_map_path()).await?;
        let forwards = ForwardSupervisor::new(
            Arc::clone(&workspaces),
            launcher,
            config.forward_log_dir(),
        );

        Ok(Self {
            synthesizer: ManifestSynthesizer::new(Arc::clone(&renderer)),
            driver: ExecutionDriver::new(kubectl.clone()),
            waiter: CompletionWaiter::new(kubectl, config.poll_interval, config.build_timeout),
            deployer: AppDeployer::new(renderer, Arc::clone(&endpoints)),
            workspaces,
            endpoints,
            store,
            forwards,
            host_ip,
            config,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Build and deploy
    // ------------------------------------------------------------------

    /// Validate a raw request and render its documents.
    pub fn prepare(&self, raw: RunRequest) -> Result<Plan> {
        let request = raw.validate()?;
        let manifests = self.synthesizer.synthesize(&request)?;
        Ok(Plan { request, manifests })
    }

    /// Submit a plan's documents to the build cluster.
    pub async fn submit(&self, plan: &Plan) -> Result<Submission> {
        self.driver
            .submit(&plan.manifests, &plan.request.namespace)
            .await
    }

    /// Wait for `task_run` and, when the request names an app, deploy it.
    ///
    /// Returns `None` when there is nothing to deploy.
    pub async fn complete(
        &self,
        request: &DeployRequest,
        task_run: &str,
    ) -> Result<Option<DeployedApp>> {
        self.waiter
            .wait(&request.namespace, task_run)
            .await
            .into_result(task_run, self.waiter.deadline())?;

        let Some(key) = request.target() else {
            info!(task_run = %task_run, "Build finished, no app to deploy");
            return Ok(None);
        };

        self.workspaces.ensure(&key.workspace).await?;
        let kubectl = self.workspaces.kubectl_for(&key.workspace);
        let deployed = self
            .deployer
            .deploy(
                &kubectl,
                &key,
                &request.image.reference(),
                request.deploy.container_port,
            )
            .await?;

        let held = self.forwards.lock(&key).await;
        if let Some(entry) = self.store.get(&key.workspace, &key.app).await {
            if let Err(e) = self.forwards.ensure_held(&held, entry.external_port).await {
                warn!(
                    workspace = %key.workspace,
                    app = %key.app,
                    port = entry.external_port,
                    error = %e,
                    "App deployed but forward failed"
                );
            }
        }
        Ok(Some(deployed))
    }

    /// Run [`Self::complete`] on a detached task. Failures are only logged.
    pub fn spawn_completion(
        self: &Arc<Self>,
        request: DeployRequest,
        task_run: String,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.complete(&request, &task_run).await {
                Ok(Some(app)) => info!(
                    task_run = %task_run,
                    endpoint = %app.endpoint,
                    "Deployment finished"
                ),
                Ok(None) => {}
                Err(e) => error!(task_run = %task_run, error = %e, "Deployment failed"),
            }
        })
    }

    // ------------------------------------------------------------------
    // Workspaces
    // ------------------------------------------------------------------

    /// URL of an app, resolving and caching it on a miss.
    pub async fn endpoint(&self, workspace: &str, app: &str) -> Result<String> {
        let key = app_key(workspace, app)?;
        let kubectl = self.workspaces.kubectl_for(workspace);
        self.endpoints
            .resolve(&key, || async {
                kubectl.service_node_port(&key.workspace, &key.app).await
            })
            .await
            .map_err(|e| {
                if matches!(e, RunnerError::NotFound(_)) {
                    e
                } else {
                    RunnerError::NotFound(e.to_string())
                }
            })
    }

    pub async fn list_workspaces(&self) -> Result<Vec<WorkspaceSummary>> {
        self.workspaces.list().await
    }

    pub async fn workspace_status(&self, workspace: &str) -> Result<WorkspaceStatus> {
        self.workspaces.status(workspace).await
    }

    /// Delete a workspace and everything keyed by it.
    ///
    /// Forwards and mappings are only dropped once the cluster is gone, so a
    /// failed destroy leaves the workspace fully reachable.
    pub async fn delete_workspace(&self, workspace: &str) -> Result<WorkspaceDeleted> {
        validate_workspace_name(workspace)?;
        self.workspaces.destroy(workspace).await?;
        let mappings_removed = self.store.remove_workspace(workspace).await?.len();
        let forwards_stopped = self.forwards.stop_workspace(workspace).await;
        self.endpoints.evict_workspace(workspace);
        info!(
            workspace = %workspace,
            forwards_stopped,
            mappings_removed,
            "Workspace deleted"
        );
        Ok(WorkspaceDeleted {
            workspace: workspace.to_string(),
            forwards_stopped,
            mappings_removed,
        })
    }

    /// Scale one app of a workspace, or all of them.
    pub async fn scale_workspace(
        &self,
        workspace: &str,
        app: Option<&str>,
        replicas: u32,
    ) -> Result<()> {
        validate_workspace_name(workspace)?;
        validate_replicas(replicas)?;
        self.workspaces
            .kubectl_for(workspace)
            .scale(workspace, app, replicas)
            .await
    }

    pub async fn restart_workspace(&self, workspace: &str) -> Result<()> {
        validate_workspace_name(workspace)?;
        self.workspaces
            .kubectl_for(workspace)
            .rollout_restart(workspace, None)
            .await
    }

    // ------------------------------------------------------------------
    // Apps
    // ------------------------------------------------------------------

    pub async fn app_status(&self, workspace: &str, app: &str) -> Result<AppStatus> {
        let key = app_key(workspace, app)?;
        let kubectl = self.workspaces.kubectl_for(workspace);
        let selector = format!("app={}", key.app);
        let (pods, node_port, replicas) = tokio::join!(
            kubectl.pods(workspace, Some(&selector)),
            kubectl.service_node_port(workspace, &key.app),
            kubectl.replicas(workspace, &key.app),
        );
        Ok(AppStatus {
            workspace: key.workspace,
            app: key.app,
            pods: pods?,
            node_port: node_port.ok(),
            replicas: replicas.unwrap_or_default(),
        })
    }

    /// Delete an app's deployment and service, its forward and its mapping.
    pub async fn delete_app(&self, workspace: &str, app: &str) -> Result<()> {
        let key = app_key(workspace, app)?;
        self.workspaces
            .kubectl_for(workspace)
            .delete_app(workspace, &key.app)
            .await?;
        self.endpoints.evict(&key);
        let held = self.forwards.lock(&key).await;
        self.store.remove(&key.workspace, &key.app).await?;
        self.forwards.stop_held(&held).await;
        info!(workspace = %key.workspace, app = %key.app, "App deleted");
        Ok(())
    }

    pub async fn scale_app(&self, workspace: &str, app: &str, replicas: u32) -> Result<()> {
        let key = app_key(workspace, app)?;
        self.scale_workspace(workspace, Some(&key.app), replicas).await
    }

    pub async fn restart_app(&self, workspace: &str, app: &str) -> Result<()> {
        let key = app_key(workspace, app)?;
        self.workspaces
            .kubectl_for(workspace)
            .rollout_restart(workspace, Some(&key.app))
            .await
    }

    // ------------------------------------------------------------------
    // External ports
    // ------------------------------------------------------------------

    pub async fn external_map(&self) -> Vec<ExternalPortEntry> {
        self.store.list().await
    }

    /// Persist a port mapping and bring its forward up.
    ///
    /// The mapping stays persisted when the forward cannot start; it is
    /// retried on the next restore. Calls for the same app are serialized,
    /// so the last mapping persisted is also the one forwarded.
    pub async fn set_external_port(&self, entry: ExternalPortEntry) -> Result<PortMapped> {
        let key = app_key(&entry.workspace, &entry.app)?;
        if entry.external_port == 0 {
            return Err(RunnerError::validation(
                "external_port must be between 1 and 65535",
            ));
        }
        let entry = ExternalPortEntry::new(key.workspace.clone(), key.app.clone(), entry.external_port);
        let held = self.forwards.lock(&key).await;
        self.store.upsert(entry.clone()).await?;
        let forward = self.forwards.ensure_held(&held, entry.external_port).await?;
        Ok(PortMapped { entry, forward })
    }

    /// Remove a port mapping and stop its forward.
    pub async fn remove_external_port(
        &self,
        workspace: &str,
        app: &str,
    ) -> Result<ExternalPortEntry> {
        let key = app_key(workspace, app)?;
        let held = self.forwards.lock(&key).await;
        let removed = self
            .store
            .remove(&key.workspace, &key.app)
            .await?
            .ok_or_else(|| RunnerError::NotFound(format!("no external port mapped for {key}")))?;
        self.forwards.stop_held(&held).await;
        Ok(removed)
    }

    pub async fn forwards(&self) -> Vec<ForwardSummary> {
        self.forwards.snapshot().await
    }

    /// Rebuild forwards for every persisted mapping.
    pub async fn restore_forwards(&self) -> usize {
        let restored = self.forwards.restore(&self.store).await;
        info!(restored, "Restored forwards");
        restored
    }

    // ------------------------------------------------------------------
    // Host
    // ------------------------------------------------------------------

    /// Externally reachable host address.
    ///
    /// The configured address when set, otherwise the one detected at startup.
    pub fn host_ip(&self) -> &str {
        &self.host_ip
    }

    /// Stop every forward.
    pub async fn shutdown(&self) {
        self.forwards.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLauncher, ScriptedRunner};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        runner: Arc<ScriptedRunner>,
        launcher: Arc<FakeLauncher>,
        orchestrator: Arc<Orchestrator>,
    }

    async fn fixture(runner: ScriptedRunner) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunnerConfig::rooted_at(dir.path());
        config.poll_interval = Duration::from_millis(5);
        config.build_timeout = Duration::from_secs(5);
        config.host_ip = Some("10.0.0.9".into());
        let runner = Arc::new(runner);
        let launcher = Arc::new(FakeLauncher::new());
        let orchestrator = Orchestrator::new(config, runner.clone(), launcher.clone())
            .await
            .unwrap();
        Fixture {
            _dir: dir,
            runner,
            launcher,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn zip_request() -> RunRequest {
        serde_json::from_value(json!({
            "app_name": "Web",
            "source": { "type": "zip", "zip_url": "http://files/web.zip" },
            "image": { "project": "Web", "tag": "v1" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_complete_deploys_app() {
        let runner = ScriptedRunner::new();
        runner.on("kubectl", &["create"], "taskrun.tekton.dev/build-and-push-run-q1w2e");
        runner.on("kubectl", &["conditions[0].status"], "True");
        runner.on("kind", &["get", "clusters"], "");
        runner.on("kubectl", &["svc", "web"], "30500");
        runner.on("kubectl", &["nodes"], "172.18.0.2");
        let fx = fixture(runner).await;

        // A mapping made before the deploy gets its forward once the app exists.
        fx.orchestrator
            .store
            .upsert(ExternalPortEntry::new("ws-web", "web", 8600))
            .await
            .unwrap();

        let plan = fx.orchestrator.prepare(zip_request()).unwrap();
        let submission = fx.orchestrator.submit(&plan).await.unwrap();
        assert_eq!(submission.task_run.as_deref(), Some("build-and-push-run-q1w2e"));

        let deployed = fx
            .orchestrator
            .complete(&plan.request, "build-and-push-run-q1w2e")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deployed.key, AppKey::new("ws-web", "web"));
        assert_eq!(deployed.endpoint, "http://10.0.0.9:30500");
        assert_eq!(
            fx.orchestrator.endpoint("ws-web", "web").await.unwrap(),
            "http://10.0.0.9:30500"
        );

        let applied = fx.runner.calls_with("kubectl", "ws-web.yaml");
        let bundle = applied
            .iter()
            .find(|c| c.has_arg("apply"))
            .and_then(|c| c.stdin.clone())
            .unwrap();
        assert!(bundle.contains("\"lenovo:8443/web/web:v1\""));
        assert_eq!(fx.launcher.live(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_skips_deploy() {
        let runner = ScriptedRunner::new();
        runner.on("kubectl", &["conditions[0].status"], "False");
        runner.on("kubectl", &["conditions[0].message"], "step build exited 1");
        let fx = fixture(runner).await;

        let plan = fx.orchestrator.prepare(zip_request()).unwrap();
        let err = fx
            .orchestrator
            .complete(&plan.request, "run-x")
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::BuildFailed { .. }));
        assert!(fx.runner.calls_with("kind", "clusters").is_empty());
    }

    #[tokio::test]
    async fn test_external_port_lifecycle() {
        let runner = ScriptedRunner::new();
        runner.on("kubectl", &["svc", "web"], "30500");
        runner.on("kubectl", &["nodes"], "172.18.0.2");
        let fx = fixture(runner).await;

        let mapped = fx
            .orchestrator
            .set_external_port(ExternalPortEntry::new("ws-a", "web", 9000))
            .await
            .unwrap();
        assert_eq!(mapped.forward, EnsureOutcome::Started);

        let err = fx
            .orchestrator
            .set_external_port(ExternalPortEntry::new("ws-b", "web", 9000))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Conflict { .. }));

        let err = fx
            .orchestrator
            .set_external_port(ExternalPortEntry::new("a", "web", 9001))
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        let removed = fx.orchestrator.remove_external_port("ws-a", "web").await.unwrap();
        assert_eq!(removed.external_port, 9000);
        assert!(fx.orchestrator.external_map().await.is_empty());
        assert_eq!(fx.launcher.live(), 0);
        assert!(matches!(
            fx.orchestrator.remove_external_port("ws-a", "web").await,
            Err(RunnerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_workspace_cleans_up() {
        let runner = ScriptedRunner::new();
        runner.on("kubectl", &["svc", "web"], "30500");
        runner.on("kubectl", &["nodes"], "172.18.0.2");
        let fx = fixture(runner).await;

        fx.orchestrator
            .set_external_port(ExternalPortEntry::new("ws-a", "web", 9000))
            .await
            .unwrap();
        fx.orchestrator
            .set_external_port(ExternalPortEntry::new("ws-b", "web", 9001))
            .await
            .unwrap();
        fx.orchestrator.endpoint("ws-a", "web").await.unwrap();

        let deleted = fx.orchestrator.delete_workspace("ws-a").await.unwrap();
        assert_eq!(
            deleted,
            WorkspaceDeleted {
                workspace: "ws-a".into(),
                forwards_stopped: 1,
                mappings_removed: 1,
            }
        );
        assert_eq!(fx.launcher.live(), 1);
        assert_eq!(
            fx.orchestrator.external_map().await,
            [ExternalPortEntry::new("ws-b", "web", 9001)]
        );
        assert!(fx.orchestrator.endpoints.get(&AppKey::new("ws-a", "web")).is_none());
        assert_eq!(fx.runner.calls_with("kind", "delete").len(), 1);
    }

    #[tokio::test]
    async fn test_admin_validation() {
        let fx = fixture(ScriptedRunner::new()).await;
        assert!(fx.orchestrator.workspace_status("demo").await.is_err());
        assert!(fx.orchestrator.restart_app("ws-a", " ").await.is_err());
        let err = fx
            .orchestrator
            .scale_workspace("ws-a", None, 101)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "replicas must be between 0 and 100");
        assert!(fx.runner.calls().is_empty());

        fx.orchestrator.scale_app("ws-a", "web", 0).await.unwrap();
        assert!(fx.runner.calls()[0].has_arg("deployment/web"));
    }

    #[tokio::test]
    async fn test_app_status_tolerates_missing_service() {
        let runner = ScriptedRunner::new();
        runner.on("kubectl", &["pods"], "web-1|Running\n");
        runner.on("kubectl", &["readyReplicas"], "1|2");
        let fx = fixture(runner).await;

        let status = fx.orchestrator.app_status("ws-a", "web").await.unwrap();
        assert_eq!(status.pods.len(), 1);
        assert_eq!(status.node_port, None);
        assert_eq!(status.replicas, ReplicaCounts { ready: 1, desired: 2 });
        let pods_call = fx.runner.calls_with("kubectl", "pods");
        assert!(pods_call[0].has_arg("app=web"));
    }

    #[tokio::test]
    async fn test_failed_destroy_keeps_mappings_and_forwards() {
        let runner = ScriptedRunner::new();
        runner.on("kubectl", &["svc", "web"], "30500");
        runner.on("kubectl", &["nodes"], "172.18.0.2");
        runner.fail("kind", &["delete"], "boom");
        let fx = fixture(runner).await;

        fx.orchestrator
            .set_external_port(ExternalPortEntry::new("ws-a", "web", 9000))
            .await
            .unwrap();
        fx.orchestrator.endpoint("ws-a", "web").await.unwrap();

        assert!(fx.orchestrator.delete_workspace("ws-a").await.is_err());
        assert_eq!(fx.launcher.live(), 1);
        assert_eq!(
            fx.orchestrator.external_map().await,
            [ExternalPortEntry::new("ws-a", "web", 9000)]
        );
        assert!(fx.orchestrator.endpoints.get(&AppKey::new("ws-a", "web")).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_port_changes_keep_map_and_forward_in_step() {
        let runner = ScriptedRunner::new();
        runner.on("kubectl", &["svc", "web"], "30500");
        runner.on("kubectl", &["nodes"], "172.18.0.2");
        let fx = fixture(runner).await;
        // The first launch is still coming up when the second request lands.
        fx.launcher.delay_port(9000, Duration::from_millis(300));

        let first = fx
            .orchestrator
            .set_external_port(ExternalPortEntry::new("ws-a", "web", 9000));
        let second = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fx.orchestrator
                .set_external_port(ExternalPortEntry::new("ws-a", "web", 9001))
                .await
        };
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap().forward, EnsureOutcome::Started);
        assert_eq!(
            second.unwrap().forward,
            EnsureOutcome::Restarted { previous_port: 9000 }
        );

        assert_eq!(
            fx.orchestrator.external_map().await,
            [ExternalPortEntry::new("ws-a", "web", 9001)]
        );
        let ports: Vec<u16> = fx
            .orchestrator
            .forwards()
            .await
            .iter()
            .map(|f| f.external_port)
            .collect();
        assert_eq!(ports, [9001]);
        assert_eq!(fx.launcher.live(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_port_launches_once() {
        let runner = ScriptedRunner::new();
        runner.on("kubectl", &["svc", "web"], "30500");
        runner.on("kubectl", &["nodes"], "172.18.0.2");
        let fx = fixture(runner).await;
        fx.launcher.delay_port(9000, Duration::from_millis(100));

        let entry = ExternalPortEntry::new("ws-a", "web", 9000);
        let (a, b) = tokio::join!(
            fx.orchestrator.set_external_port(entry.clone()),
            fx.orchestrator.set_external_port(entry),
        );
        let mut outcomes = [a.unwrap().forward, b.unwrap().forward];
        outcomes.sort_by_key(|o| *o == EnsureOutcome::Unchanged);
        assert_eq!(outcomes, [EnsureOutcome::Started, EnsureOutcome::Unchanged]);
        assert_eq!(fx.launcher.launched().len(), 1);
        assert_eq!(fx.launcher.live(), 1);
    }

    #[tokio::test]
    async fn test_host_ip_detection() {
        let runner = ScriptedRunner::new();
        runner.on("hostname", &["-I"], "127.0.1.1 192.168.1.50 fd00::5\n");
        runner.on("kubectl", &["svc", "web"], "30500");
        let fx = fixture(runner).await;
        // Configured address wins and detection never runs.
        assert_eq!(fx.orchestrator.host_ip(), "10.0.0.9");
        assert!(fx.runner.calls_with("hostname", "-I").is_empty());

        let dir = tempfile::tempdir().unwrap();
        let bare = Orchestrator::new(
            RunnerConfig::rooted_at(dir.path()),
            fx.runner.clone(),
            fx.launcher.clone(),
        )
        .await
        .unwrap();
        assert_eq!(bare.host_ip(), "192.168.1.50");
        // Endpoints use the same address /hostinfo reports.
        assert_eq!(
            bare.endpoint("ws-a", "web").await.unwrap(),
            "http://192.168.1.50:30500"
        );
        assert_eq!(fx.runner.calls_with("hostname", "-I").len(), 1);
    }

    #[tokio::test]
    async fn test_host_ip_falls_back_to_loopback() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("hostname", &["-I"], "not supported");
        assert_eq!(detect_host_ip(runner.as_ref()).await, "127.0.0.1");

        let runner = ScriptedRunner::new();
        runner.on("hostname", &["-I"], "127.0.0.1 ::1\n");
        assert_eq!(detect_host_ip(&runner).await, "127.0.0.1");
    }
}
