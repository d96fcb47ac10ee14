//! Deploys built images into workspaces.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::endpoints::EndpointCache;
use crate::error::Result;
use crate::kubectl::Kubectl;
use crate::templates::{self, Renderer};
use crate::workspace::AppKey;

#[derive(Serialize)]
struct AppBundleContext<'a> {
    namespace: &'a str,
    app: &'a str,
    image: &'a str,
    port: u16,
}

/// A deployed app and where it can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployedApp {
    #[serde(flatten)]
    pub key: AppKey,
    pub node_port: u16,
    pub endpoint: String,
}

/// Applies namespace, deployment and service for an app.
pub struct AppDeployer {
    renderer: Arc<Renderer>,
    endpoints: Arc<EndpointCache>,
}

impl AppDeployer {
    pub fn new(renderer: Arc<Renderer>, endpoints: Arc<EndpointCache>) -> Self {
        Self {
            renderer,
            endpoints,
        }
    }

    /// Render the bundle for `key` without applying it.
    pub fn render(&self, key: &AppKey, image: &str, container_port: u16) -> Result<String> {
        self.renderer.render(
            templates::APP_BUNDLE,
            &AppBundleContext {
                namespace: &key.workspace,
                app: &key.app,
                image,
                port: container_port,
            },
        )
    }

    /// Apply the bundle through `kubectl` (bound to the workspace) and cache
    /// the endpoint of the resulting service.
    pub async fn deploy(
        &self,
        kubectl: &Kubectl,
        key: &AppKey,
        image: &str,
        container_port: u16,
    ) -> Result<DeployedApp> {
        let bundle = self.render(key, image, container_port)?;
        kubectl.apply(&bundle).await?;

        let node_port = kubectl.service_node_port(&key.workspace, &key.app).await?;
        let endpoint = self.endpoints.insert(key.clone(), node_port);
        info!(
            workspace = %key.workspace,
            app = %key.app,
            image = %image,
            endpoint = %endpoint,
            "App deployed"
        );
        Ok(DeployedApp {
            key: key.clone(),
            node_port,
            endpoint,
        })
    }
}
