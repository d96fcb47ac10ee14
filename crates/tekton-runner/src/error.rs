//! Error types for the runner.
//!
//! Every failure surfaced by the orchestration engine falls into one of four
//! families: a malformed request, a failed external tool invocation, a port
//! conflict in the external map, or a build that did not finish. The HTTP
//! layer maps each family onto a status code via [`RunnerError::status_code`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The request is malformed or incomplete. No external call was made.
    #[error("{0}")]
    Validation(String),

    /// An external tool (kubectl, kind, docker, the forwarder) failed.
    #[error("{tool} failed: {message}")]
    ExternalCall { tool: String, message: String },

    /// The external port is already claimed by another workspace/app.
    #[error("external port {port} is already mapped to {workspace}/{app}")]
    Conflict {
        port: u16,
        workspace: String,
        app: String,
    },

    /// The build task did not resolve before the deadline.
    #[error("task run {task_run} did not finish within {waited_secs}s")]
    Timeout { task_run: String, waited_secs: u64 },

    /// The build task reported failure.
    #[error("task run {task_run} failed: {message}")]
    BuildFailed { task_run: String, message: String },

    /// A looked-up resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Missing or wrong bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// A rendered document is not a usable resource document.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("template error: {0}")]
    Template(#[from] Box<handlebars::TemplateError>),

    #[error("render error: {0}")]
    Render(#[from] handlebars::RenderError),
}

impl RunnerError {
    /// Build an [`RunnerError::ExternalCall`] for `tool`.
    pub fn external(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalCall {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Build a [`RunnerError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Stable snake_case tag for API responses.
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ExternalCall { .. } => "external_call_error",
            Self::Conflict { .. } => "conflict",
            Self::Timeout { .. } => "timeout",
            Self::BuildFailed { .. } => "build_failed",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Manifest(_) => "manifest_error",
            Self::Io(_) => "io_error",
            Self::Json(_) | Self::Yaml(_) => "serialization_error",
            Self::Template(_) | Self::Render(_) => "template_error",
        }
    }

    /// HTTP status for this error.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ExternalCall { .. }
            | Self::BuildFailed { .. }
            | Self::Manifest(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::Template(_)
            | Self::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller, not the server, is at fault.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.error_type(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors() {
        assert_eq!(
            RunnerError::validation("image.project is required").status_code(),
            StatusCode::BAD_REQUEST
        );
        let conflict = RunnerError::Conflict {
            port: 9000,
            workspace: "ws-a".into(),
            app: "app1".into(),
        };
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);
        assert!(conflict.is_client_error());
        assert_eq!(
            conflict.to_string(),
            "external port 9000 is already mapped to ws-a/app1"
        );
    }

    #[test]
    fn test_server_errors() {
        let err = RunnerError::external("kubectl", "connection refused");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "kubectl failed: connection refused");
        assert!(!err.is_client_error());

        let timeout = RunnerError::Timeout {
            task_run: "build-and-push-run-x".into(),
            waited_secs: 2700,
        };
        assert!(timeout.status_code().is_server_error());
        assert_eq!(timeout.error_type(), "timeout");
    }
}
