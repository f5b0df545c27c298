// ABOUTME: API error type and its JSON rendering
// ABOUTME: Maps lifecycle, volume and auth failures to sanitized responses with a request id

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use skiff_sandbox::archive::ArchiveError;
use skiff_sandbox::{LifecycleError, ManagerError, Stage, StageError, VolumeError};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::AuthError;
use crate::completion::CompletionError;

/// Error type every handler returns
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sandbox_id: Option<String>,
}

/// Stage name reported to clients; everything before the server starts is provisioning
fn public_stage(stage: Stage) -> &'static str {
    match stage {
        Stage::Image | Stage::Create | Stage::Provisioning => "provisioning",
        Stage::Setup => "setup",
        Stage::Start | Stage::Probe => "start",
        Stage::Exposure => "exposure",
    }
}

fn cause_kind(source: &StageError) -> &'static str {
    match source {
        StageError::Provision(e) => e.kind(),
        StageError::Image(_) => "image_error",
        StageError::Provider(_) => "platform_error",
        StageError::Supervisor(_) => "process_error",
        StageError::Exposure(_) => "exposure_error",
        StageError::Storage(_) => "storage_error",
    }
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            AppError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            AppError::Lifecycle(e) => match e.stage {
                Stage::Image | Stage::Create | Stage::Provisioning => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "PROVISIONING_FAILED")
                }
                Stage::Setup | Stage::Start | Stage::Probe => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "PROCESS_START_FAILED")
                }
                Stage::Exposure => (StatusCode::INTERNAL_SERVER_ERROR, "EXPOSURE_UNAVAILABLE"),
            },
            AppError::Volume(e) => match e {
                VolumeError::InvalidName(_) | VolumeError::LinkRefused(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                VolumeError::SourceNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                VolumeError::Archive(ArchiveError::Corrupt(_))
                | VolumeError::Archive(ArchiveError::UnsafeEntry(_)) => {
                    (StatusCode::BAD_REQUEST, "INVALID_ARCHIVE")
                }
                VolumeError::Archive(ArchiveError::Io(_)) | VolumeError::Io(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
                }
            },
            AppError::Manager(e) => match e {
                ManagerError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            AppError::Completion(_) => (StatusCode::BAD_GATEWAY, "COMPLETION_FAILED"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Message safe to show a client; no paths, stderr or platform detail
    fn user_message(&self) -> String {
        match self {
            AppError::Unauthorized(_) => "Authentication required".to_string(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Unavailable(msg) => msg.clone(),
            AppError::PayloadTooLarge => "Upload exceeds the size limit".to_string(),
            AppError::Lifecycle(e) => match e.stage {
                Stage::Image | Stage::Create | Stage::Provisioning => {
                    format!("Sandbox provisioning failed ({})", cause_kind(&e.source))
                }
                Stage::Setup => "A setup command failed".to_string(),
                Stage::Start | Stage::Probe => "The application server failed to start".to_string(),
                Stage::Exposure => {
                    "No public route to the sandbox is available; the sandbox is still running"
                        .to_string()
                }
            },
            AppError::Volume(e) => match e {
                VolumeError::InvalidName(_) => "Invalid file name".to_string(),
                VolumeError::LinkRefused(_) => "File path crosses a link".to_string(),
                VolumeError::SourceNotFound(_) => "Project source not found".to_string(),
                VolumeError::Archive(ArchiveError::Io(_)) | VolumeError::Io(_) => {
                    "Volume storage error".to_string()
                }
                VolumeError::Archive(_) => "Uploaded file is not a valid zip file or gzip tarball".to_string(),
            },
            AppError::Manager(ManagerError::NotFound(_)) => "Sandbox not found".to_string(),
            AppError::Manager(_) => "An internal server error occurred".to_string(),
            AppError::Completion(_) => "The completion service request failed".to_string(),
            AppError::Internal(_) => "An internal server error occurred".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status_code, error_code) = self.status_and_code();

        // Full detail stays in the logs, keyed by request id
        if status_code.is_server_error() {
            error!(
                request_id = %request_id,
                error_code = %error_code,
                error = ?self,
                "Request failed"
            );
        } else {
            info!(
                request_id = %request_id,
                error_code = %error_code,
                error = %self,
                "API error response"
            );
        }

        let (stage, sandbox_id) = match &self {
            AppError::Lifecycle(e) => (Some(public_stage(e.stage)), Some(e.sandbox_id.clone())),
            _ => (None, None),
        };

        let body = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: error_code.to_string(),
                message: self.user_message(),
                stage,
                sandbox_id,
            },
            request_id,
        };

        (status_code, Json(body)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use skiff_sandbox::{ProvisionError, SupervisorError};

    async fn render(err: AppError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn lifecycle(stage: Stage, source: StageError, torn_down: bool) -> AppError {
        AppError::Lifecycle(LifecycleError {
            stage,
            sandbox_id: "sbx-1".to_string(),
            torn_down,
            source,
        })
    }

    #[tokio::test]
    async fn test_provisioning_failure_body() {
        let err = lifecycle(
            Stage::Provisioning,
            ProvisionError::CorruptArchive("/tmp/secret/path bad header".to_string()).into(),
            true,
        );
        let (status, body) = render(err).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "PROVISIONING_FAILED");
        assert_eq!(body["error"]["stage"], "provisioning");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("corrupt_archive"));
        assert!(!body.to_string().contains("/tmp/secret"));
        assert!(body["request_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_process_start_hides_stderr() {
        let err = lifecycle(
            Stage::Setup,
            SupervisorError::NonZeroExit {
                command: "npm install".to_string(),
                code: 1,
                stderr: "ERR! enoent /home/builder/.npmrc".to_string(),
            }
            .into(),
            true,
        );
        let (status, body) = render(err).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "PROCESS_START_FAILED");
        assert!(!body.to_string().contains(".npmrc"));
    }

    #[tokio::test]
    async fn test_exposure_failure_reports_sandbox() {
        let err = lifecycle(
            Stage::Exposure,
            skiff_sandbox::ExposureError::Unavailable {
                sandbox_id: "sbx-1".to_string(),
                port: 3000,
            }
            .into(),
            false,
        );
        let (_, body) = render(err).await;

        assert_eq!(body["error"]["code"], "EXPOSURE_UNAVAILABLE");
        assert_eq!(body["error"]["sandbox_id"], "sbx-1");
    }

    #[tokio::test]
    async fn test_plain_errors_have_no_stage() {
        let (status, body) = render(AppError::validation("Content is required")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "Content is required");
        assert!(body["error"].get("stage").is_none());

        let (status, body) = render(AuthError::MissingToken.into()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }
}
