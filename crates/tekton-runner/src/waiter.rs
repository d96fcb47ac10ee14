//! Polls a build task until it resolves or the deadline passes.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, RunnerError};
use crate::kubectl::Kubectl;

const STATUS_PATH: &str = "{.status.conditions[0].status}";
const MESSAGE_PATH: &str = "{.status.conditions[0].message}";

/// State of a build task as seen by the waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    Succeeded,
    /// Carries the condition message reported by the task.
    Failed(String),
    TimedOut,
}

impl BuildState {
    /// Map a condition status value. Anything but `True`/`False` is pending.
    fn from_condition(status: &str) -> Self {
        match status {
            "True" => Self::Succeeded,
            "False" => Self::Failed(String::new()),
            _ => Self::Pending,
        }
    }

    /// Turn a final state into a result for callers that only care about success.
    pub fn into_result(self, task_run: &str, waited: Duration) -> Result<()> {
        match self {
            Self::Succeeded => Ok(()),
            Self::Failed(message) => Err(RunnerError::BuildFailed {
                task_run: task_run.to_string(),
                message,
            }),
            Self::Pending | Self::TimedOut => Err(RunnerError::Timeout {
                task_run: task_run.to_string(),
                waited_secs: waited.as_secs(),
            }),
        }
    }
}

/// Bounded poll loop over a task's first status condition.
#[derive(Clone)]
pub struct CompletionWaiter {
    kubectl: Kubectl,
    interval: Duration,
    deadline: Duration,
}

impl CompletionWaiter {
    pub fn new(kubectl: Kubectl, interval: Duration, deadline: Duration) -> Self {
        Self {
            kubectl,
            interval,
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Poll `namespace/name` until it succeeds, fails or times out.
    ///
    /// A failed status read is treated like a pending task; the deadline
    /// still bounds the loop.
    pub async fn wait(&self, namespace: &str, name: &str) -> BuildState {
        let start = Instant::now();
        info!(
            task_run = %name,
            timeout_secs = self.deadline.as_secs(),
            "Waiting for build task"
        );

        loop {
            let state = match self.kubectl.jsonpath(namespace, "taskrun", name, STATUS_PATH).await {
                Ok(status) => BuildState::from_condition(&status),
                Err(e) => {
                    debug!(task_run = %name, error = %e, "Status read failed");
                    BuildState::Pending
                }
            };

            match state {
                BuildState::Succeeded => {
                    info!(task_run = %name, elapsed_secs = start.elapsed().as_secs(), "Build succeeded");
                    return state;
                }
                BuildState::Failed(_) => {
                    let message = self
                        .kubectl
                        .jsonpath(namespace, "taskrun", name, MESSAGE_PATH)
                        .await
                        .unwrap_or_else(|e| e.to_string());
                    warn!(task_run = %name, message = %message, "Build failed");
                    return BuildState::Failed(message);
                }
                BuildState::Pending | BuildState::TimedOut => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= self.deadline {
                warn!(task_run = %name, "Build did not finish before the deadline");
                return BuildState::TimedOut;
            }
            sleep(self.interval.min(self.deadline - elapsed)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use std::sync::Arc;

    fn waiter(runner: &Arc<ScriptedRunner>, deadline_ms: u64) -> CompletionWaiter {
        CompletionWaiter::new(
            Kubectl::new(runner.clone()),
            Duration::from_millis(5),
            Duration::from_millis(deadline_ms),
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_pending_values() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_sequence("kubectl", &["conditions[0].status"], &["", "Unknown", "True"]);

        let state = waiter(&runner, 5_000).wait("tekton-pipelines", "run-1").await;
        assert_eq!(state, BuildState::Succeeded);
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_carries_message() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("kubectl", &["conditions[0].status"], "False");
        runner.on("kubectl", &["conditions[0].message"], "build failed: exit 1");

        let state = waiter(&runner, 5_000).wait("tekton-pipelines", "run-1").await;
        assert_eq!(state, BuildState::Failed("build failed: exit 1".into()));

        let err = state
            .into_result("run-1", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.to_string(), "task run run-1 failed: build failed: exit 1");
    }

    #[tokio::test]
    async fn test_times_out_on_read_errors() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("kubectl", &["taskrun"], "not found");

        let state = waiter(&runner, 30).wait("tekton-pipelines", "run-1").await;
        assert_eq!(state, BuildState::TimedOut);
        assert!(runner.calls().len() >= 2);

        let err = state
            .into_result("run-1", Duration::from_secs(2700))
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { waited_secs: 2700, .. }));
    }
}
