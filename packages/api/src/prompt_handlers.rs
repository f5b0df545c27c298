// ABOUTME: HTTP handler forwarding a prompt to the completion service
// ABOUTME: Returns 503 when no completion client is configured

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::CurrentUser;
use crate::error::{ApiResult, AppError};
use crate::AppState;

#[derive(Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
}

#[derive(Serialize)]
pub struct PromptResponse {
    pub response: String,
}

pub async fn prompt(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<PromptRequest>,
) -> ApiResult<Json<PromptResponse>> {
    let Some(client) = state.completion.as_ref() else {
        return Err(AppError::Unavailable(
            "Completion service is not configured".to_string(),
        ));
    };

    info!(user_id = %current_user.id, prompt_len = request.prompt.len(), "Completing prompt");
    let response = client.complete(&request.prompt).await?;
    Ok(Json(PromptResponse { response }))
}
