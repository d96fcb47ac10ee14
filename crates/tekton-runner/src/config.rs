//! Runtime configuration.
//!
//! [`RunnerConfig`] is resolved once by the binary from command-line flags and
//! environment variables and then passed around as plain data.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default registry images are pushed to and pulled from.
pub const DEFAULT_REGISTRY: &str = "lenovo:8443";

/// Default deadline for a build task to resolve (45 minutes).
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Default interval between build status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// File name of the persisted external port map inside the state directory.
const EXTERNAL_MAP_FILE: &str = "external-map.json";

/// Sub-directory of the state directory holding forwarder logs.
const FORWARD_LOG_DIR: &str = "forwards";

/// Registry trust applied to every workspace node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryTrust {
    /// Registry host, optionally with port (e.g. `lenovo:8443`).
    pub host: String,
    /// Address the registry hostname should resolve to inside the node.
    pub ip: Option<String>,
}

impl RegistryTrust {
    /// Registry hostname without port.
    pub fn hostname(&self) -> &str {
        self.host.split(':').next().unwrap_or(&self.host)
    }
}

impl Default for RegistryTrust {
    fn default() -> Self {
        Self {
            host: DEFAULT_REGISTRY.to_string(),
            ip: None,
        }
    }
}

/// Resolved runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory holding one kubeconfig per workspace (`<dir>/<workspace>.yaml`).
    pub kubeconfig_dir: PathBuf,
    /// Directory holding the external port map and forwarder logs.
    pub state_dir: PathBuf,
    /// Node image for new workspace clusters; `None` uses the provisioner default.
    pub node_image: Option<String>,
    /// Registry trust configuration for workspace nodes.
    pub registry: RegistryTrust,
    /// Externally reachable host address used to build endpoints.
    pub host_ip: Option<String>,
    /// Program used to bridge external ports to workspace node ports.
    pub forward_bin: String,
    /// Deadline for a build task to resolve.
    pub build_timeout: Duration,
    /// Interval between build status polls.
    pub poll_interval: Duration,
}

impl RunnerConfig {
    /// Configuration rooted at `base`, with defaults for everything else.
    ///
    /// Useful for tests and for running from a scratch directory.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            kubeconfig_dir: base.join("kubeconfigs"),
            state_dir: base.join("state"),
            ..Self::default()
        }
    }

    /// Path of the persisted external port map.
    pub fn external_map_path(&self) -> PathBuf {
        self.state_dir.join(EXTERNAL_MAP_FILE)
    }

    /// Directory where forwarder output is captured.
    pub fn forward_log_dir(&self) -> PathBuf {
        self.state_dir.join(FORWARD_LOG_DIR)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            kubeconfig_dir: default_kubeconfig_dir(),
            state_dir: default_state_dir(),
            node_image: None,
            registry: RegistryTrust::default(),
            host_ip: None,
            forward_bin: "socat".to_string(),
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Default workspace kubeconfig directory (`~/.kube/workspaces`).
pub fn default_kubeconfig_dir() -> PathBuf {
    dirs::home_dir().map_or_else(
        || PathBuf::from("kubeconfigs"),
        |h| h.join(".kube").join("workspaces"),
    )
}

/// Default state directory (`~/.local/state/tekton-runner`).
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir().map_or_else(
        || PathBuf::from("state"),
        |h| h.join(".local").join("state").join("tekton-runner"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_hostname_strips_port() {
        let trust = RegistryTrust::default();
        assert_eq!(trust.hostname(), "lenovo");

        let bare = RegistryTrust {
            host: "registry.local".into(),
            ip: None,
        };
        assert_eq!(bare.hostname(), "registry.local");
    }

    #[test]
    fn test_rooted_paths() {
        let config = RunnerConfig::rooted_at(Path::new("/tmp/runner"));
        assert_eq!(
            config.external_map_path(),
            PathBuf::from("/tmp/runner/state/external-map.json")
        );
        assert_eq!(
            config.forward_log_dir(),
            PathBuf::from("/tmp/runner/state/forwards")
        );
        assert!(config.host_ip.is_none());
        assert_eq!(config.build_timeout, Duration::from_secs(2700));
    }
}
