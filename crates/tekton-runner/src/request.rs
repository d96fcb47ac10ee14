//! Deploy request model and validation.
//!
//! Requests arrive as loosely-typed JSON ([`RunRequest`]) where every field is
//! optional. [`RunRequest::validate`] fills defaults, checks structure and
//! produces a [`DeployRequest`] whose source and storage are sum types, so the
//! rest of the crate never re-checks which fields are present.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_REGISTRY;
use crate::error::{Result, RunnerError};
use crate::names::sanitize_name;
use crate::workspace::{validate_workspace_name, AppKey, WORKSPACE_PREFIX};

pub const DEFAULT_NAMESPACE: &str = "tekton-pipelines";
pub const DEFAULT_TASK: &str = "build-and-push-generic";
pub const DEFAULT_REVISION: &str = "main";
pub const DEFAULT_TAG: &str = "latest";
pub const DEFAULT_CONTAINER_PORT: u16 = 8080;
pub const DEFAULT_VOLUME_SIZE: &str = "50Gi";

// ============================================================================
// Wire format
// ============================================================================

/// Raw deploy request as received over HTTP or read from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub namespace: Option<String>,
    pub task: Option<String>,
    pub app_name: Option<String>,
    pub workspace: Option<String>,
    pub source: SourceInput,
    pub image: ImageInput,
    pub deploy: DeployInput,
}

/// Raw source descriptor. Only the fields relevant to `type` are read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceInput {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub repo_url: Option<String>,
    pub revision: Option<String>,
    pub git_username: Option<String>,
    pub git_token: Option<String>,
    pub git_secret: Option<String>,
    pub local_path: Option<String>,
    pub pvc_name: Option<String>,
    pub zip_url: Option<String>,
    pub zip_username: Option<String>,
    pub zip_password: Option<String>,
    pub nfs: Option<NfsInput>,
    pub smb: Option<SmbInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsInput {
    pub server: Option<String>,
    pub path: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmbInput {
    pub server: Option<String>,
    pub share: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub size: Option<String>,
    pub volume_handle: Option<String>,
    pub secret_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageInput {
    pub project: Option<String>,
    pub tag: Option<String>,
    pub registry: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployInput {
    pub container_port: Option<u16>,
}

// ============================================================================
// Validated model
// ============================================================================

/// A validated deploy request with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    /// Namespace the build task runs in.
    pub namespace: String,
    /// Name of the Tekton task to run.
    pub task: String,
    /// Application name as given by the caller.
    pub app_name: Option<String>,
    /// Target workspace, if given explicitly.
    pub workspace: Option<String>,
    pub source: SourceSpec,
    pub image: ImageSpec,
    pub deploy: DeploySpec,
}

/// Where the build task fetches sources from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Git(GitSource),
    Local(LocalSource),
    Archive(ArchiveSource),
}

impl SourceSpec {
    /// Value of the task's `source-type` parameter.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Git(_) => "git",
            Self::Local(_) => "local",
            Self::Archive(_) => "zip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSource {
    pub repo_url: String,
    pub revision: String,
    /// Present only when both username and token were supplied.
    pub credentials: Option<GitCredentials>,
    /// Caller-chosen name for the credentials secret.
    pub secret_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCredentials {
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSource {
    /// Path inside the claim that holds the sources.
    pub local_path: String,
    pub storage: LocalStorage,
}

/// How the claim backing a local source comes to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalStorage {
    /// A claim that already exists in the build namespace.
    ExistingClaim(String),
    /// Provision a volume and claim from an NFS export.
    Nfs(NfsShare),
    /// Provision a volume, claim and credentials secret for an SMB share.
    Smb(SmbShare),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsShare {
    pub server: String,
    pub path: String,
    pub size: String,
    /// Name for the provisioned claim; generated when absent.
    pub claim_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbShare {
    /// Name for the provisioned claim; generated when absent.
    pub claim_name: Option<String>,
    pub server: String,
    pub share: String,
    pub username: String,
    pub password: String,
    pub size: String,
    pub volume_handle: Option<String>,
    pub secret_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub project: String,
    pub tag: String,
    pub registry: String,
}

impl ImageSpec {
    /// Image reference the build pushes and the workspace pulls.
    pub fn reference(&self) -> String {
        let project = self.project.to_lowercase();
        format!("{}/{project}/{project}:{}", self.registry, self.tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploySpec {
    pub container_port: u16,
}

impl DeployRequest {
    /// Workspace and app this request deploys into, if it names an app.
    ///
    /// Without an explicit workspace the name is derived from the app.
    pub fn target(&self) -> Option<AppKey> {
        let app = sanitize_name(self.app_name.as_deref()?);
        let workspace = self
            .workspace
            .clone()
            .unwrap_or_else(|| format!("{WORKSPACE_PREFIX}{app}"));
        Some(AppKey::new(workspace, app))
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Treat blank strings as absent.
fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, message: &str) -> Result<String> {
    present(value).ok_or_else(|| RunnerError::validation(message))
}

impl RunRequest {
    /// Parse a request from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| RunnerError::validation(format!("invalid JSON: {e}")))
    }

    /// Apply defaults and validate, producing a [`DeployRequest`].
    ///
    /// Fails on the first missing or invalid field; nothing external has
    /// happened yet when this returns an error.
    pub fn validate(self) -> Result<DeployRequest> {
        let source = self.source;
        let kind = present(source.kind).unwrap_or_default();
        if !matches!(kind.as_str(), "git" | "local" | "zip" | "archive") {
            return Err(RunnerError::validation(
                "source.type must be git, local, or zip",
            ));
        }

        let project = required(self.image.project, "image.project is required")?;
        let app_name = present(self.app_name);

        let source = match kind.as_str() {
            "git" => SourceSpec::Git(validate_git(
                source.repo_url,
                source.revision,
                source.git_username,
                source.git_token,
                source.git_secret,
            )?),
            "local" => SourceSpec::Local(LocalSource {
                local_path: required(
                    source.local_path,
                    "source.local_path is required for local",
                )?,
                storage: validate_storage(source.pvc_name, source.nfs, source.smb)?,
            }),
            _ => {
                let url = required(source.zip_url, "source.zip_url is required for zip")?;
                if app_name.is_none() {
                    return Err(RunnerError::validation(
                        "app_name is required for zip deployments",
                    ));
                }
                SourceSpec::Archive(ArchiveSource {
                    url,
                    username: present(source.zip_username),
                    password: present(source.zip_password),
                })
            }
        };

        let workspace = present(self.workspace);
        if let Some(ws) = &workspace {
            validate_workspace_name(ws)?;
        }

        let container_port = match self.deploy.container_port {
            None | Some(0) => DEFAULT_CONTAINER_PORT,
            Some(port) => port,
        };

        Ok(DeployRequest {
            namespace: present(self.namespace).unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            task: present(self.task).unwrap_or_else(|| DEFAULT_TASK.to_string()),
            app_name,
            workspace,
            source,
            image: ImageSpec {
                project,
                tag: present(self.image.tag).unwrap_or_else(|| DEFAULT_TAG.to_string()),
                registry: present(self.image.registry)
                    .unwrap_or_else(|| DEFAULT_REGISTRY.to_string()),
            },
            deploy: DeploySpec { container_port },
        })
    }
}

fn validate_git(
    repo_url: Option<String>,
    revision: Option<String>,
    username: Option<String>,
    token: Option<String>,
    secret_name: Option<String>,
) -> Result<GitSource> {
    let repo_url = required(repo_url, "source.repo_url is required for git")?;
    let credentials = match (present(username), present(token)) {
        (Some(username), Some(token)) => Some(GitCredentials { username, token }),
        _ => None,
    };
    Ok(GitSource {
        repo_url,
        revision: present(revision).unwrap_or_else(|| DEFAULT_REVISION.to_string()),
        credentials,
        secret_name: present(secret_name),
    })
}

fn validate_storage(
    claim: Option<String>,
    nfs: Option<NfsInput>,
    smb: Option<SmbInput>,
) -> Result<LocalStorage> {
    let claim = present(claim);
    match (nfs, smb) {
        (Some(_), Some(_)) => Err(RunnerError::validation(
            "source.nfs and source.smb are mutually exclusive",
        )),
        (Some(nfs), None) => Ok(LocalStorage::Nfs(NfsShare {
            server: required(nfs.server, "source.nfs.server is required")?,
            path: required(nfs.path, "source.nfs.path is required")?,
            size: present(nfs.size).unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string()),
            claim_name: claim,
        })),
        (None, Some(smb)) => Ok(LocalStorage::Smb(SmbShare {
            claim_name: claim,
            server: required(smb.server, "source.smb.server is required")?,
            share: required(smb.share, "source.smb.share is required")?,
            username: present(smb.username).unwrap_or_default(),
            password: present(smb.password).unwrap_or_default(),
            size: present(smb.size).unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string()),
            volume_handle: present(smb.volume_handle),
            secret_name: present(smb.secret_name),
        })),
        (None, None) => claim.map(LocalStorage::ExistingClaim).ok_or_else(|| {
            RunnerError::validation(
                "source.pvc_name or source.nfs/source.smb is required for local",
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<DeployRequest> {
        serde_json::from_value::<RunRequest>(value)
            .expect("request should deserialize")
            .validate()
    }

    fn message(result: Result<DeployRequest>) -> String {
        match result {
            Err(RunnerError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_git_defaults() {
        let req = parse(json!({
            "source": { "type": "git", "repo_url": "https://example/repo.git" },
            "image": { "project": "DemoApp" }
        }))
        .unwrap();

        assert_eq!(req.namespace, DEFAULT_NAMESPACE);
        assert_eq!(req.task, DEFAULT_TASK);
        assert_eq!(req.image.tag, "latest");
        assert_eq!(req.image.registry, "lenovo:8443");
        assert_eq!(req.deploy.container_port, 8080);
        match &req.source {
            SourceSpec::Git(git) => {
                assert_eq!(git.revision, "main");
                assert!(git.credentials.is_none());
            }
            other => panic!("unexpected source {other:?}"),
        }
        assert_eq!(req.image.reference(), "lenovo:8443/demoapp/demoapp:latest");
        assert!(req.target().is_none());
    }

    #[test]
    fn test_git_credentials_need_both_fields() {
        let req = parse(json!({
            "source": { "type": "git", "repo_url": "https://x/y.git", "git_username": "bot" },
            "image": { "project": "p" }
        }))
        .unwrap();
        let SourceSpec::Git(git) = req.source else {
            panic!("expected git source");
        };
        assert!(git.credentials.is_none());
    }

    #[test]
    fn test_unknown_source_type() {
        let err = message(parse(json!({
            "source": { "type": "svn" },
            "image": { "project": "p" }
        })));
        assert_eq!(err, "source.type must be git, local, or zip");
    }

    #[test]
    fn test_project_required() {
        let err = message(parse(json!({
            "source": { "type": "git", "repo_url": "https://x/y.git" },
            "image": { "project": "  " }
        })));
        assert_eq!(err, "image.project is required");
    }

    #[test]
    fn test_local_requires_storage() {
        let err = message(parse(json!({
            "source": { "type": "local", "local_path": "/mnt/projects/demo" },
            "image": { "project": "p" }
        })));
        assert_eq!(
            err,
            "source.pvc_name or source.nfs/source.smb is required for local"
        );
    }

    #[test]
    fn test_local_requires_path() {
        let err = message(parse(json!({
            "source": { "type": "local", "pvc_name": "sources" },
            "image": { "project": "p" }
        })));
        assert_eq!(err, "source.local_path is required for local");
    }

    #[test]
    fn test_local_storage_is_exclusive() {
        let err = message(parse(json!({
            "source": {
                "type": "local",
                "local_path": "/src",
                "nfs": { "server": "10.0.0.5", "path": "/export" },
                "smb": { "server": "fs", "share": "src" }
            },
            "image": { "project": "p" }
        })));
        assert_eq!(err, "source.nfs and source.smb are mutually exclusive");
    }

    #[test]
    fn test_nfs_default_size() {
        let req = parse(json!({
            "source": {
                "type": "local",
                "local_path": "/src",
                "nfs": { "server": "10.0.0.5", "path": "/export" }
            },
            "image": { "project": "p" }
        }))
        .unwrap();
        let SourceSpec::Local(local) = req.source else {
            panic!("expected local source");
        };
        assert_eq!(
            local.storage,
            LocalStorage::Nfs(NfsShare {
                server: "10.0.0.5".into(),
                path: "/export".into(),
                size: "50Gi".into(),
                claim_name: None,
            })
        );
    }

    #[test]
    fn test_claim_name_applies_to_provisioned_storage() {
        let req = parse(json!({
            "source": {
                "type": "local",
                "local_path": "/src",
                "pvc_name": "team-sources",
                "smb": { "server": "fs01", "share": "src", "size": "10Gi" }
            },
            "image": { "project": "p" }
        }))
        .unwrap();
        let SourceSpec::Local(LocalSource {
            storage: LocalStorage::Smb(smb),
            ..
        }) = req.source
        else {
            panic!("expected smb storage");
        };
        assert_eq!(smb.claim_name.as_deref(), Some("team-sources"));
        assert_eq!(smb.size, "10Gi");
    }

    #[test]
    fn test_zip_requires_app_name() {
        let err = message(parse(json!({
            "source": { "type": "zip", "zip_url": "http://zip/app.zip" },
            "image": { "project": "p" }
        })));
        assert_eq!(err, "app_name is required for zip deployments");

        let err = message(parse(json!({
            "app_name": "demo",
            "source": { "type": "zip" },
            "image": { "project": "p" }
        })));
        assert_eq!(err, "source.zip_url is required for zip");
    }

    #[test]
    fn test_archive_alias_and_target() {
        let req = parse(json!({
            "app_name": "Demo App",
            "source": { "type": "archive", "zip_url": "http://zip/app.zip" },
            "image": { "project": "p" },
            "deploy": { "container_port": 3000 }
        }))
        .unwrap();
        assert_eq!(req.source.type_name(), "zip");
        assert_eq!(req.deploy.container_port, 3000);
        assert_eq!(req.target(), Some(AppKey::new("ws-demo-app", "demo-app")));
    }

    #[test]
    fn test_workspace_prefix_enforced() {
        let err = message(parse(json!({
            "app_name": "demo",
            "workspace": "demo",
            "source": { "type": "zip", "zip_url": "http://zip/app.zip" },
            "image": { "project": "p" }
        })));
        assert_eq!(err, "workspace must start with \"ws-\"");

        let req = parse(json!({
            "app_name": "demo",
            "workspace": "ws-team",
            "source": { "type": "zip", "zip_url": "http://zip/app.zip" },
            "image": { "project": "p" }
        }))
        .unwrap();
        assert_eq!(req.target(), Some(AppKey::new("ws-team", "demo")));
    }

    #[test]
    fn test_invalid_json() {
        let err = RunRequest::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, RunnerError::Validation(msg) if msg.starts_with("invalid JSON")));
    }
}
