//! Resource document synthesis.
//!
//! [`ManifestSynthesizer::synthesize`] turns a validated [`DeployRequest`]
//! into the ordered documents the execution driver submits: an optional git
//! credentials secret, storage documents for NFS/SMB-backed local sources,
//! and the `TaskRun` that starts the build, always last.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{Result, RunnerError};
use crate::names::random_suffix;
use crate::request::{DeployRequest, LocalStorage, NfsShare, SmbShare, SourceSpec};
use crate::templates::{self, Renderer};

/// Kind of the document that starts asynchronous work.
pub const SUBMISSION_KIND: &str = "TaskRun";

/// One rendered resource document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Declared `kind`.
    pub kind: String,
    /// `metadata.name`, absent for documents using `generateName`.
    pub name: Option<String>,
    /// Serialized YAML.
    pub body: String,
}

impl Manifest {
    /// Parse a rendered document, reading its kind and name.
    pub fn parse(body: String) -> Result<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(&body)?;
        let kind = doc
            .get("kind")
            .and_then(serde_yaml::Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RunnerError::Manifest("document has no kind".to_string()))?
            .to_string();
        let name = doc
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(serde_yaml::Value::as_str)
            .map(str::to_string);
        Ok(Self { kind, name, body })
    }

    /// Whether submitting this document starts a build.
    pub fn is_submission(&self) -> bool {
        self.kind == SUBMISSION_KIND
    }

    /// `kind/name` for logs.
    pub fn describe(&self) -> String {
        format!("{}/{}", self.kind, self.name.as_deref().unwrap_or("<generated>"))
    }
}

/// Join documents into one multi-document YAML stream.
pub fn join(manifests: &[Manifest]) -> String {
    manifests
        .iter()
        .map(|m| m.body.trim_end())
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Names generated for one synthesis call.
///
/// Every document that refers to one of these gets the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedNames {
    pub git_secret: String,
    pub nfs_volume: String,
    pub nfs_claim: String,
    pub smb_volume: String,
    pub smb_claim: String,
    pub smb_secret: String,
    pub smb_volume_handle: String,
}

impl GeneratedNames {
    pub fn from_suffix(suffix: &str) -> Self {
        Self {
            git_secret: format!("git-cred-{suffix}"),
            nfs_volume: format!("pv-nfs-{suffix}"),
            nfs_claim: format!("pvc-nfs-{suffix}"),
            smb_volume: format!("pv-smb-{suffix}"),
            smb_claim: format!("pvc-smb-{suffix}"),
            smb_secret: format!("smb-cred-{suffix}"),
            smb_volume_handle: format!("smb-{suffix}"),
        }
    }
}

#[derive(Serialize)]
struct SecretContext<'a> {
    name: &'a str,
    namespace: &'a str,
    username: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Serialize)]
struct NfsVolumeContext<'a> {
    name: &'a str,
    size: &'a str,
    server: &'a str,
    path: &'a str,
}

#[derive(Serialize)]
struct SmbVolumeContext<'a> {
    name: &'a str,
    size: &'a str,
    volume_handle: &'a str,
    source: String,
    secret_name: &'a str,
    namespace: &'a str,
}

#[derive(Serialize)]
struct ClaimContext<'a> {
    name: &'a str,
    namespace: &'a str,
    size: &'a str,
    volume_name: &'a str,
}

#[derive(Serialize)]
struct GitParams<'a> {
    repo_url: &'a str,
    revision: &'a str,
}

#[derive(Serialize)]
struct ArchiveParams<'a> {
    url: &'a str,
    username: Option<&'a str>,
    password: Option<&'a str>,
}

#[derive(Serialize)]
struct TaskRunContext<'a> {
    namespace: &'a str,
    task: &'a str,
    source_type: &'a str,
    git: Option<GitParams<'a>>,
    archive: Option<ArchiveParams<'a>>,
    project: &'a str,
    registry: &'a str,
    tag: &'a str,
    local_path: Option<&'a str>,
    git_secret: Option<&'a str>,
    claim_name: Option<&'a str>,
}

/// Builds the document sequence for a request.
#[derive(Clone)]
pub struct ManifestSynthesizer {
    renderer: Arc<Renderer>,
}

impl ManifestSynthesizer {
    pub fn new(renderer: Arc<Renderer>) -> Self {
        Self { renderer }
    }

    /// Synthesize with freshly generated names.
    pub fn synthesize(&self, req: &DeployRequest) -> Result<Vec<Manifest>> {
        self.synthesize_with_suffix(req, &random_suffix())
    }

    /// Synthesize with names derived from `suffix`.
    pub fn synthesize_with_suffix(&self, req: &DeployRequest, suffix: &str) -> Result<Vec<Manifest>> {
        let names = GeneratedNames::from_suffix(suffix);
        let ns = req.namespace.as_str();
        let mut docs = Vec::with_capacity(4);

        let mut git_secret = None;
        if let SourceSpec::Git(git) = &req.source {
            if let Some(creds) = &git.credentials {
                let name = git.secret_name.as_deref().unwrap_or(&names.git_secret);
                docs.push(self.renderer.render(
                    templates::GIT_SECRET,
                    &SecretContext {
                        name,
                        namespace: ns,
                        username: &creds.username,
                        token: Some(&creds.token),
                        password: None,
                    },
                )?);
                git_secret = Some(name);
            }
        }

        let mut claim_name = None;
        if let SourceSpec::Local(local) = &req.source {
            let claim = match &local.storage {
                LocalStorage::ExistingClaim(claim) => claim.as_str(),
                LocalStorage::Nfs(nfs) => self.nfs_documents(nfs, ns, &names, &mut docs)?,
                LocalStorage::Smb(smb) => self.smb_documents(smb, ns, &names, &mut docs)?,
            };
            claim_name = Some(claim);
        }

        let (git, archive, local_path) = match &req.source {
            SourceSpec::Git(git) => (
                Some(GitParams {
                    repo_url: &git.repo_url,
                    revision: &git.revision,
                }),
                None,
                None,
            ),
            SourceSpec::Archive(archive) => (
                None,
                Some(ArchiveParams {
                    url: &archive.url,
                    username: archive.username.as_deref(),
                    password: archive.password.as_deref(),
                }),
                None,
            ),
            SourceSpec::Local(local) => (None, None, Some(local.local_path.as_str())),
        };

        docs.push(self.renderer.render(
            templates::TASK_RUN,
            &TaskRunContext {
                namespace: ns,
                task: &req.task,
                source_type: req.source.type_name(),
                git,
                archive,
                project: &req.image.project,
                registry: &req.image.registry,
                tag: &req.image.tag,
                local_path,
                git_secret,
                claim_name,
            },
        )?);

        docs.into_iter().map(Manifest::parse).collect()
    }

    /// Render volume and claim for an NFS export, returning the claim name.
    fn nfs_documents<'a>(
        &self,
        nfs: &'a NfsShare,
        ns: &str,
        names: &'a GeneratedNames,
        docs: &mut Vec<String>,
    ) -> Result<&'a str> {
        let claim = nfs.claim_name.as_deref().unwrap_or(&names.nfs_claim);
        docs.push(self.renderer.render(
            templates::NFS_VOLUME,
            &NfsVolumeContext {
                name: &names.nfs_volume,
                size: &nfs.size,
                server: &nfs.server,
                path: &nfs.path,
            },
        )?);
        docs.push(self.renderer.render(
            templates::CLAIM,
            &ClaimContext {
                name: claim,
                namespace: ns,
                size: &nfs.size,
                volume_name: &names.nfs_volume,
            },
        )?);
        Ok(claim)
    }

    /// Render credentials, volume and claim for an SMB share, returning the
    /// claim name.
    fn smb_documents<'a>(
        &self,
        smb: &'a SmbShare,
        ns: &str,
        names: &'a GeneratedNames,
        docs: &mut Vec<String>,
    ) -> Result<&'a str> {
        let claim = smb.claim_name.as_deref().unwrap_or(&names.smb_claim);
        let secret = smb.secret_name.as_deref().unwrap_or(&names.smb_secret);
        let handle = smb
            .volume_handle
            .as_deref()
            .unwrap_or(&names.smb_volume_handle);

        docs.push(self.renderer.render(
            templates::SMB_SECRET,
            &SecretContext {
                name: secret,
                namespace: ns,
                username: &smb.username,
                token: None,
                password: Some(&smb.password),
            },
        )?);
        docs.push(self.renderer.render(
            templates::SMB_VOLUME,
            &SmbVolumeContext {
                name: &names.smb_volume,
                size: &smb.size,
                volume_handle: handle,
                source: format!("//{}/{}", smb.server, smb.share),
                secret_name: secret,
                namespace: ns,
            },
        )?);
        docs.push(self.renderer.render(
            templates::CLAIM,
            &ClaimContext {
                name: claim,
                namespace: ns,
                size: &smb.size,
                volume_name: &names.smb_volume,
            },
        )?);
        Ok(claim)
    }
}
