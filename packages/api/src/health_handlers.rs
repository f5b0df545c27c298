// ABOUTME: Unauthenticated health endpoint
// ABOUTME: Reports service liveness and whether the sandbox platform answers

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub provider: String,
    pub provider_available: bool,
    pub version: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider = state.manager.provider();
    let provider_available = provider.is_available().await.unwrap_or(false);

    Json(HealthResponse {
        status: "ok",
        provider: provider.name().to_string(),
        provider_available,
        version: env!("CARGO_PKG_VERSION"),
    })
}
