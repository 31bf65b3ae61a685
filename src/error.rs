use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Error kinds a provider operation or lifecycle step can fail with.
///
/// Mirrors the table in the error-handling design: each variant carries
/// enough context for the lifecycle engine to decide whether to retry, and
/// for the HTTP edge to pick a status code.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("sandbox already running")]
    AlreadyRunning,
    #[error("sandbox not running")]
    NotRunning,
    #[error("completion already in progress")]
    CompletionInProgress { completion_id: Uuid },
    #[error("provider not ready: {0}")]
    ProviderNotReady(String),
    #[error("workspace clone failed: {0}")]
    WorkspaceCloneFailed(String),
    #[error("image pull failed: {0}")]
    ImagePullFailed(String),
    #[error("sandbox create failed: {0}")]
    SandboxCreateFailed(String),
    #[error("sandbox start failed: {0}")]
    SandboxStartFailed(String),
    #[error("store conflict, retry")]
    StoreConflict,
    #[error("unauthorized")]
    AuthError,
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::AlreadyExists | AppError::AlreadyRunning | AppError::NotRunning => {
                StatusCode::CONFLICT
            }
            AppError::CompletionInProgress { .. } | AppError::StoreConflict => {
                StatusCode::CONFLICT
            }
            AppError::ProviderNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::AuthError => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Cancelled => StatusCode::BAD_REQUEST,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::WorkspaceCloneFailed(_)
            | AppError::ImagePullFailed(_)
            | AppError::SandboxCreateFailed(_)
            | AppError::SandboxStartFailed(_)
            | AppError::Db(_)
            | AppError::Docker(_)
            | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_client_error() {
            tracing::warn!(error = %self, "request rejected");
        } else {
            tracing::error!(error = %self, "request failed");
        }

        match &self {
            AppError::CompletionInProgress { completion_id } => (
                status,
                Json(json!({
                    "error": "completion_in_progress",
                    "completionId": completion_id,
                })),
            )
                .into_response(),
            _ => (
                status,
                Json(json!({"error": self.kind(), "message": self.to_string()})),
            )
                .into_response(),
        }
    }
}

impl AppError {
    /// Stable machine-readable name for the variant, independent of the
    /// human-readable message carried in `Display`.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Db(_) => "store_error",
            AppError::Docker(_) => "sandbox_create_failed",
            AppError::NotFound => "not_found",
            AppError::AlreadyExists => "already_exists",
            AppError::AlreadyRunning => "already_running",
            AppError::NotRunning => "not_running",
            AppError::CompletionInProgress { .. } => "completion_in_progress",
            AppError::ProviderNotReady(_) => "provider_not_ready",
            AppError::WorkspaceCloneFailed(_) => "workspace_clone_failed",
            AppError::ImagePullFailed(_) => "image_pull_failed",
            AppError::SandboxCreateFailed(_) => "sandbox_create_failed",
            AppError::SandboxStartFailed(_) => "sandbox_start_failed",
            AppError::StoreConflict => "store_conflict",
            AppError::AuthError => "auth_error",
            AppError::Cancelled => "cancelled",
            AppError::Timeout => "timeout",
            AppError::BadRequest(_) => "bad_request",
            AppError::Message(_) => "internal_error",
        }
    }

    /// Whether the lifecycle engine should retry the step that produced this
    /// error rather than transition the session to `error`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Timeout | AppError::ProviderNotReady(_))
    }
}

pub type AppResult<T> = Result<T, AppError>;
