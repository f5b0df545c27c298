// ABOUTME: HTTP API layer for Skiff providing the sandbox endpoints and routing
// ABOUTME: Shared application state, CORS and tracing layers around the handlers

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use skiff_sandbox::{ImageDescriptor, PersistentVolume, SandboxManager};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub mod auth;
pub mod completion;
pub mod error;
pub mod health_handlers;
pub mod prompt_handlers;
pub mod sandbox_handlers;

pub use auth::{AuthError, CurrentUser, JwtAlgorithm, JwtVerifier, Principal, TokenVerifier};
pub use completion::{CompletionClient, CompletionError, OpenAiClient};
pub use error::{ApiResult, AppError};

/// HTTP-facing settings that are not part of the sandbox lifecycle
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Project copied by `/sandbox/project/copy` and run with `source: "prebuilt"`
    pub prebuilt_path: PathBuf,
    pub max_upload_bytes: usize,
    pub cors_origin: String,
    /// Image every run uses
    pub image: ImageDescriptor,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            prebuilt_path: PathBuf::from(skiff_config::DEFAULT_PREBUILT_PATH),
            max_upload_bytes: skiff_config::DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            cors_origin: skiff_config::DEFAULT_CORS_ORIGIN.to_string(),
            image: ImageDescriptor::default_node(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SandboxManager>,
    pub volume: PersistentVolume,
    pub verifier: Arc<dyn TokenVerifier>,
    /// `None` when no completion key is configured
    pub completion: Option<Arc<dyn CompletionClient>>,
    pub settings: Arc<ApiSettings>,
}

impl AppState {
    pub fn new(
        manager: Arc<SandboxManager>,
        volume: PersistentVolume,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            manager,
            volume,
            verifier,
            completion: None,
            settings: Arc::new(ApiSettings::default()),
        }
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionClient>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_settings(mut self, settings: ApiSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }
}

/// Creates the sandbox API router (nested under /sandbox)
pub fn create_sandbox_router(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/prompt", post(prompt_handlers::prompt))
        .route("/write", post(sandbox_handlers::write_file))
        .route("/read", get(sandbox_handlers::read_file))
        .route(
            "/upload",
            post(sandbox_handlers::upload_project).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/project/copy", post(sandbox_handlers::copy_project))
        .route("/project/run", post(sandbox_handlers::run_project))
        .route("/project/run/ngrok", post(sandbox_handlers::run_project_ngrok))
        .route("/instances", get(sandbox_handlers::list_instances))
        .route(
            "/instances/{id}",
            get(sandbox_handlers::get_instance).delete(sandbox_handlers::stop_instance),
        )
}

fn cors_layer(origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    match HeaderValue::from_str(origin) {
        Ok(value) => cors.allow_origin(value),
        Err(_) => {
            warn!(origin = %origin, "Ignoring invalid CORS origin");
            cors
        }
    }
}

/// Full application router with middleware
pub fn create_router(state: AppState) -> Router {
    let sandbox = create_sandbox_router(state.settings.max_upload_bytes);

    Router::new()
        .route("/api/health", get(health_handlers::health))
        .nest("/sandbox", sandbox)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.settings.cors_origin))
        .with_state(state)
}
