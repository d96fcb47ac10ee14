//! Submits synthesized documents to the control plane.

use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::kubectl::Kubectl;
use crate::manifest::Manifest;

/// Outcome of submitting a document sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Submission {
    /// Generated name of the created build task, if the sequence had one.
    pub task_run: Option<String>,
    /// `kind/name` of every applied declarative document.
    pub applied: Vec<String>,
}

/// Applies declarative documents and creates the build submission.
#[derive(Clone)]
pub struct ExecutionDriver {
    kubectl: Kubectl,
}

impl ExecutionDriver {
    pub fn new(kubectl: Kubectl) -> Self {
        Self { kubectl }
    }

    /// Submit `manifests` in order.
    ///
    /// Declarative documents are applied and may be repeated safely. The
    /// submission document is created, which starts a new build each time.
    /// The first failure stops the sequence.
    pub async fn submit(&self, manifests: &[Manifest], namespace: &str) -> Result<Submission> {
        let mut submission = Submission::default();
        for manifest in manifests {
            if manifest.is_submission() {
                let name = self.kubectl.create(&manifest.body, namespace).await?;
                info!(task_run = %name, namespace = %namespace, "Created build task");
                submission.task_run = Some(name);
            } else {
                self.kubectl.apply(&manifest.body).await?;
                info!(resource = %manifest.describe(), "Applied");
                submission.applied.push(manifest.describe());
            }
        }
        Ok(submission)
    }
}
