//! Control-plane boundary: kubectl invocations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::command::{CommandRunner, Invocation};
use crate::error::{Result, RunnerError};

/// Pod name and phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodSummary {
    pub name: String,
    pub phase: String,
}

/// Service name and its first node port, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    #[serde(rename = "nodePort")]
    pub node_port: Option<u16>,
}

/// Ready and desired replica counts of a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaCounts {
    pub ready: u32,
    pub desired: u32,
}

/// kubectl client bound to an optional kubeconfig.
#[derive(Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    kubeconfig: Option<PathBuf>,
}

impl Kubectl {
    /// kubectl using the ambient credentials.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            kubeconfig: None,
        }
    }

    /// Same runner, pointed at another cluster's credentials.
    pub fn with_kubeconfig(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            kubeconfig: Some(path.into()),
        }
    }

    /// Credentials file override, if any.
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    fn command(&self) -> Invocation {
        let inv = Invocation::new("kubectl");
        match &self.kubeconfig {
            Some(path) => inv.args(["--kubeconfig".to_string(), path.display().to_string()]),
            None => inv,
        }
    }

    async fn run(&self, inv: Invocation) -> Result<String> {
        let output = self.runner.run_checked(&inv).await?;
        Ok(output.stdout_text())
    }

    /// `kubectl apply -f -`. Safe to repeat.
    pub async fn apply(&self, manifest: &str) -> Result<()> {
        self.run(self.command().args(["apply", "-f", "-"]).stdin(manifest))
            .await
            .map(drop)
    }

    /// `kubectl create -f - -o name`, returning the generated object name.
    ///
    /// Not idempotent: every call creates a new object.
    pub async fn create(&self, manifest: &str, namespace: &str) -> Result<String> {
        let out = self
            .run(
                self.command()
                    .args(["-n", namespace, "create", "-f", "-", "-o", "name"])
                    .stdin(manifest),
            )
            .await?;
        parse_created_name(&out)
    }

    /// Read a field of one resource via a jsonpath expression.
    pub async fn jsonpath(
        &self,
        namespace: &str,
        resource: &str,
        name: &str,
        path: &str,
    ) -> Result<String> {
        self.run(self.command().args([
            "-n".to_string(),
            namespace.to_string(),
            "get".to_string(),
            resource.to_string(),
            name.to_string(),
            "-o".to_string(),
            format!("jsonpath={path}"),
        ]))
        .await
    }

    /// Scale one deployment, or every deployment when `deployment` is `None`.
    pub async fn scale(
        &self,
        namespace: &str,
        deployment: Option<&str>,
        replicas: u32,
    ) -> Result<()> {
        let target = deployment.map_or_else(
            || vec!["deployment".to_string(), "--all".to_string()],
            |d| vec![format!("deployment/{d}")],
        );
        self.run(
            self.command()
                .args(["-n", namespace, "scale"])
                .args(target)
                .arg(format!("--replicas={replicas}")),
        )
        .await
        .map(drop)
    }

    /// Rolling restart of one deployment, or every deployment when `None`.
    pub async fn rollout_restart(&self, namespace: &str, deployment: Option<&str>) -> Result<()> {
        let target = deployment.map_or_else(
            || vec!["deployment".to_string()],
            |d| vec![format!("deployment/{d}")],
        );
        self.run(
            self.command()
                .args(["-n", namespace, "rollout", "restart"])
                .args(target),
        )
        .await
        .map(drop)
    }

    /// Delete an app's deployment and service.
    pub async fn delete_app(&self, namespace: &str, app: &str) -> Result<()> {
        self.run(self.command().args([
            "-n",
            namespace,
            "delete",
            "deployment,service",
            app,
            "--ignore-not-found",
        ]))
        .await
        .map(drop)
    }

    /// Pods in `namespace`, optionally filtered by a label selector.
    pub async fn pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<PodSummary>> {
        let mut inv = self.command().args(["-n", namespace, "get", "pods"]);
        if let Some(selector) = selector {
            inv = inv.args(["-l", selector]);
        }
        let out = self
            .run(inv.args([
                "-o",
                r#"jsonpath={range .items[*]}{.metadata.name}|{.status.phase}{"\n"}{end}"#,
            ]))
            .await?;
        Ok(parse_pairs(&out)
            .map(|(name, phase)| PodSummary {
                name: name.to_string(),
                phase: phase.to_string(),
            })
            .collect())
    }

    /// Services in `namespace` with their first node port.
    pub async fn services(&self, namespace: &str) -> Result<Vec<ServiceSummary>> {
        let out = self
            .run(self.command().args([
                "-n",
                namespace,
                "get",
                "svc",
                "-o",
                r#"jsonpath={range .items[*]}{.metadata.name}|{.spec.ports[0].nodePort}{"\n"}{end}"#,
            ]))
            .await?;
        Ok(parse_pairs(&out)
            .map(|(name, port)| ServiceSummary {
                name: name.to_string(),
                node_port: port.parse().ok(),
            })
            .collect())
    }

    /// Node port assigned to the service named `app`.
    pub async fn service_node_port(&self, namespace: &str, app: &str) -> Result<u16> {
        let out = self
            .jsonpath(namespace, "svc", app, "{.spec.ports[0].nodePort}")
            .await?;
        if out.is_empty() {
            return Err(RunnerError::NotFound(format!(
                "service {namespace}/{app} has no node port"
            )));
        }
        out.parse().map_err(|_| {
            RunnerError::external("kubectl", format!("invalid node port {out:?} for {app}"))
        })
    }

    /// InternalIP of the first node, empty if not reported.
    pub async fn node_internal_ip(&self) -> Result<String> {
        self.run(self.command().args([
            "get",
            "nodes",
            "-o",
            r#"jsonpath={.items[0].status.addresses[?(@.type=="InternalIP")].address}"#,
        ]))
        .await
    }

    /// Ready and desired replicas of a deployment.
    pub async fn replicas(&self, namespace: &str, deployment: &str) -> Result<ReplicaCounts> {
        let out = self
            .jsonpath(
                namespace,
                "deployment",
                deployment,
                "{.status.readyReplicas}|{.spec.replicas}",
            )
            .await?;
        let (ready, desired) = out.split_once('|').unwrap_or((out.as_str(), ""));
        Ok(ReplicaCounts {
            ready: ready.trim().parse().unwrap_or(0),
            desired: desired.trim().parse().unwrap_or(0),
        })
    }
}

/// Extract `<name>` from `kubectl create -o name` output (`<kind>/<name>`).
pub fn parse_created_name(output: &str) -> Result<String> {
    match output.trim().split('/').collect::<Vec<_>>().as_slice() {
        [_, name] if !name.is_empty() => Ok((*name).to_string()),
        _ => Err(RunnerError::external(
            "kubectl",
            format!("unexpected create output: {output}"),
        )),
    }
}

/// Split `a|b` lines, skipping anything else.
fn parse_pairs(output: &str) -> impl Iterator<Item = (&str, &str)> {
    output
        .lines()
        .filter_map(|line| line.trim().split_once('|'))
        .filter(|(name, _)| !name.is_empty())
}
