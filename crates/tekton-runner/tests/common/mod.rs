//! Shared harness for integration tests.
//!
//! Cluster tooling is answered by [`ScriptedRunner`] and the port forwarder
//! by [`FakeLauncher`], both from the crate's `test-support` feature.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tekton_runner::server::{build_router, ServerState};
use tekton_runner::testing::{FakeLauncher, ScriptedRunner};
use tekton_runner::{Orchestrator, RunnerConfig};
use tokio::net::TcpListener;

/// Configuration rooted in `dir` with fast polling.
pub fn test_config(dir: &std::path::Path) -> RunnerConfig {
    let mut config = RunnerConfig::rooted_at(dir);
    config.host_ip = Some("10.0.0.5".to_string());
    config.poll_interval = Duration::from_millis(5);
    config.build_timeout = Duration::from_secs(2);
    config
}

/// A running service plus handles on its fakes.
pub struct TestServer {
    pub addr: SocketAddr,
    pub tools: Arc<ScriptedRunner>,
    pub launcher: Arc<FakeLauncher>,
    pub orchestrator: Arc<Orchestrator>,
    pub dir: tempfile::TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

/// Start the router on a random port.
pub async fn start_server(tools: ScriptedRunner, api_key: Option<&str>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let tools = Arc::new(tools);
    let launcher = Arc::new(FakeLauncher::new());
    let orchestrator = Arc::new(
        Orchestrator::new(test_config(dir.path()), tools.clone(), launcher.clone())
            .await
            .unwrap(),
    );
    let state = Arc::new(ServerState::new(
        Arc::clone(&orchestrator),
        api_key.map(str::to_string),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        tools,
        launcher,
        orchestrator,
        dir,
    }
}
