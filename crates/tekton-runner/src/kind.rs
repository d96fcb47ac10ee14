//! Cluster-provisioner boundary: kind clusters and their node containers.

use std::sync::Arc;

use crate::command::{CommandRunner, Invocation};
use crate::error::Result;

/// Name of the control-plane node container kind creates for `cluster`.
pub fn node_container(cluster: &str) -> String {
    format!("{cluster}-control-plane")
}

/// kind and docker operations on ephemeral clusters.
#[derive(Clone)]
pub struct Kind {
    runner: Arc<dyn CommandRunner>,
}

impl Kind {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Names of existing clusters.
    pub async fn clusters(&self) -> Result<Vec<String>> {
        let output = self
            .runner
            .run_checked(&Invocation::new("kind").args(["get", "clusters"]))
            .await?;
        Ok(output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("No kind clusters"))
            .map(str::to_string)
            .collect())
    }

    /// Create a cluster, optionally from a specific node image.
    pub async fn create(&self, name: &str, node_image: Option<&str>) -> Result<()> {
        let mut inv = Invocation::new("kind").args(["create", "cluster", "--name", name]);
        if let Some(image) = node_image {
            inv = inv.args(["--image", image]);
        }
        self.runner.run_checked(&inv).await.map(drop)
    }

    /// Raw kubeconfig for a cluster.
    pub async fn kubeconfig(&self, name: &str) -> Result<Vec<u8>> {
        let output = self
            .runner
            .run_checked(&Invocation::new("kind").args(["get", "kubeconfig", "--name", name]))
            .await?;
        Ok(output.stdout)
    }

    /// Delete a cluster.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.runner
            .run_checked(&Invocation::new("kind").args(["delete", "cluster", "--name", name]))
            .await
            .map(drop)
    }

    /// Run a shell script on the cluster's control-plane node.
    pub async fn node_exec(&self, name: &str, script: &str) -> Result<()> {
        let container = node_container(name);
        self.runner
            .run_checked(&Invocation::new("docker").args([
                "exec",
                container.as_str(),
                "sh",
                "-c",
                script,
            ]))
            .await
            .map(drop)
    }

    /// Container network address of the cluster's control-plane node.
    pub async fn node_address(&self, name: &str) -> Result<String> {
        let container = node_container(name);
        let output = self
            .runner
            .run_checked(&Invocation::new("docker").args([
                "inspect",
                "-f",
                "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                container.as_str(),
            ]))
            .await?;
        Ok(output
            .stdout_text()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string())
    }
}
