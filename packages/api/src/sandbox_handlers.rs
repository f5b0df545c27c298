// ABOUTME: HTTP request handlers for the shared volume, project staging and sandbox runs
// ABOUTME: Launches sandboxes through the lifecycle manager and manages running instances

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use skiff_sandbox::{ContentSource, ExposureKind, RunOutcome, RunRequest, RunWarning, Sandbox};
use std::time::Duration;
use tracing::info;

use crate::auth::CurrentUser;
use crate::error::{ApiResult, AppError};
use crate::AppState;

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

// ============================================================================
// VOLUME FILES
// ============================================================================

#[derive(Deserialize)]
pub struct WriteFileRequest {
    pub filename: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Write a text file into the shared volume
pub async fn write_file(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<WriteFileRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let Some(content) = request.content else {
        return Err(AppError::validation("Content is required"));
    };

    info!(user_id = %current_user.id, file = %request.filename, "Writing volume file");
    state.volume.write_file(&request.filename, &content).await?;
    Ok(MessageResponse::new(format!(
        "File '{}' saved.",
        request.filename
    )))
}

#[derive(Deserialize)]
pub struct ReadFileQuery {
    pub filename: String,
}

#[derive(Serialize)]
pub struct ReadFileResponse {
    pub content: String,
}

/// Read a text file from the shared volume; a missing file is reported in the content
pub async fn read_file(
    State(state): State<AppState>,
    _current_user: CurrentUser,
    Query(query): Query<ReadFileQuery>,
) -> ApiResult<Json<ReadFileResponse>> {
    let content = state
        .volume
        .read_file(&query.filename)
        .await?
        .unwrap_or_else(|| format!("File '{}' not found.", query.filename));
    Ok(Json(ReadFileResponse { content }))
}

// ============================================================================
// PROJECT STAGING
// ============================================================================

/// Replace the staged project with an uploaded zip file or gzip tarball (multipart field `file`)
pub async fn upload_project(
    State(state): State<AppState>,
    current_user: CurrentUser,
    mut multipart: Multipart,
) -> ApiResult<Json<MessageResponse>> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.zip").to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;

        info!(
            user_id = %current_user.id,
            file = %filename,
            bytes = bytes.len(),
            "Staging uploaded project"
        );
        let entries = state
            .volume
            .replace_project_from_archive(bytes.to_vec())
            .await?;
        return Ok(MessageResponse::new(format!(
            "Project '{}' uploaded and extracted ({} entries).",
            filename, entries
        )));
    }

    Err(AppError::validation("Multipart field 'file' is required"))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge
    } else {
        AppError::validation(format!("Invalid multipart upload: {}", err.body_text()))
    }
}

/// Replace the staged project with a copy of the prebuilt project
pub async fn copy_project(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> ApiResult<Json<MessageResponse>> {
    info!(user_id = %current_user.id, "Copying prebuilt project");
    state
        .volume
        .replace_project_from_dir(&state.settings.prebuilt_path)
        .await?;
    Ok(MessageResponse::new("Project copied to the sandbox volume."))
}

// ============================================================================
// SANDBOX RUNS
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NamedSource {
    Staged,
    Prebuilt,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaggedSource {
    Staged,
    Prebuilt,
    Repository {
        url: String,
        #[serde(default)]
        reference: Option<String>,
    },
}

/// `"staged"`, `"prebuilt"` or `{"kind": "repository", "url": ..., "reference": ...}`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProjectSource {
    Named(NamedSource),
    Tagged(TaggedSource),
}

impl Default for ProjectSource {
    fn default() -> Self {
        Self::Named(NamedSource::Staged)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunProjectRequest {
    #[serde(default)]
    pub source: ProjectSource,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl RunProjectRequest {
    /// An empty body means the defaults
    fn parse(body: &Bytes) -> ApiResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| AppError::validation(format!("Invalid request body: {}", e)))
    }

    async fn content_source(&self, state: &AppState) -> ApiResult<ContentSource> {
        let missing = |what: &str| {
            AppError::validation(format!("No {} project is available; stage one first", what))
        };

        match &self.source {
            ProjectSource::Named(NamedSource::Staged)
            | ProjectSource::Tagged(TaggedSource::Staged) => {
                // Sandboxes share the volume, so the staged directory must not be a link
                match state.volume.staged_project().await? {
                    Some(path) => Ok(ContentSource::LocalPath(path)),
                    None => Err(missing("staged")),
                }
            }
            ProjectSource::Named(NamedSource::Prebuilt)
            | ProjectSource::Tagged(TaggedSource::Prebuilt) => {
                let path = state.settings.prebuilt_path.clone();
                if path.is_dir() {
                    Ok(ContentSource::LocalPath(path))
                } else {
                    Err(missing("prebuilt"))
                }
            }
            ProjectSource::Tagged(TaggedSource::Repository { url, reference }) => {
                if url.trim().is_empty() {
                    return Err(AppError::validation("Repository url is required"));
                }
                Ok(ContentSource::Repository {
                    url: url.clone(),
                    reference: reference.clone(),
                })
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WarningBody {
    #[serde(flatten)]
    pub warning: RunWarning,
    pub message: String,
}

fn warnings(outcome: &RunOutcome) -> Vec<WarningBody> {
    outcome
        .warnings
        .iter()
        .map(|w| WarningBody {
            warning: w.clone(),
            message: w.to_string(),
        })
        .collect()
}

#[derive(Serialize)]
pub struct RunResponse {
    pub url: String,
    pub sandbox_id: String,
    pub warnings: Vec<WarningBody>,
}

#[derive(Serialize)]
pub struct AgentRunResponse {
    pub ngrok_url: String,
    pub sandbox_id: String,
    pub warnings: Vec<WarningBody>,
}

async fn launch(
    state: &AppState,
    current_user: &CurrentUser,
    body: &Bytes,
    exposure: ExposureKind,
) -> ApiResult<RunOutcome> {
    let body = RunProjectRequest::parse(body)?;
    let source = body.content_source(state).await?;

    let mut request = RunRequest::new(
        &current_user.id,
        state.settings.image.clone(),
        source,
        state.manager.settings(),
    )
    .with_exposure(exposure);
    if let Some(secs) = body.timeout_secs {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    info!(user_id = %current_user.id, exposure = %exposure, "Launching sandbox");
    Ok(state.manager.provision_and_run(request).await?)
}

/// Run the project and expose it through the platform tunnel
pub async fn run_project(
    State(state): State<AppState>,
    current_user: CurrentUser,
    body: Bytes,
) -> ApiResult<Json<RunResponse>> {
    let outcome = launch(&state, &current_user, &body, ExposureKind::Native).await?;
    Ok(Json(RunResponse {
        url: outcome.exposure.url_or_sentinel().to_string(),
        sandbox_id: outcome.sandbox.id.clone(),
        warnings: warnings(&outcome),
    }))
}

/// Run the project and expose it through the ngrok agent inside the sandbox
pub async fn run_project_ngrok(
    State(state): State<AppState>,
    current_user: CurrentUser,
    body: Bytes,
) -> ApiResult<Json<AgentRunResponse>> {
    let outcome = launch(&state, &current_user, &body, ExposureKind::Agent).await?;
    Ok(Json(AgentRunResponse {
        ngrok_url: outcome.exposure.url_or_sentinel().to_string(),
        sandbox_id: outcome.sandbox.id.clone(),
        warnings: warnings(&outcome),
    }))
}

// ============================================================================
// SANDBOX INSTANCES
// ============================================================================

pub async fn list_instances(
    State(state): State<AppState>,
    current_user: CurrentUser,
) -> Json<Vec<Sandbox>> {
    Json(state.manager.list_sandboxes(Some(&current_user.id)).await)
}

pub async fn get_instance(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Sandbox>> {
    let sandbox = state
        .manager
        .get_owned_sandbox(&id, &current_user.id)
        .await?;
    Ok(Json(sandbox))
}

pub async fn stop_instance(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Sandbox>> {
    info!(user_id = %current_user.id, sandbox_id = %id, "Stopping sandbox");
    let sandbox = state.manager.stop_sandbox(&id, &current_user.id).await?;
    Ok(Json(sandbox))
}
