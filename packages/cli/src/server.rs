// ABOUTME: Wires configuration into the sandbox manager, API state and HTTP server
// ABOUTME: Also drives one-shot runs for the command line

use anyhow::{Context, Result};
use skiff_api::{create_router, AppState, JwtVerifier, OpenAiClient};
use skiff_sandbox::{
    AgentConfig, ContentSource, DockerProvider, ExpiryMonitor, ExposureKind, ImageDescriptor,
    PersistentVolume, Provider, RunOutcome, RunRequest, SandboxManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;

/// Connect to the platform and build the lifecycle manager
pub async fn build_manager(config: &Config, volume: &PersistentVolume) -> Result<Arc<SandboxManager>> {
    let provider = DockerProvider::new()
        .context("Failed to connect to the Docker daemon")?
        .with_public_address(&config.public_host, &config.public_scheme);

    match provider.is_available().await {
        Ok(true) => info!("Docker daemon is available"),
        _ => warn!("Docker daemon did not answer; sandbox runs will fail until it does"),
    }

    if config.ngrok_authtoken.is_none() {
        warn!("NGROK_AUTHTOKEN is not set; agent tunnels will run unauthenticated");
    }

    let settings = config.sandbox_settings(volume.root());
    settings.validate().context("Invalid sandbox settings")?;

    let manager = SandboxManager::new(Arc::new(provider), settings).with_agent(AgentConfig {
        authtoken: config.ngrok_authtoken.clone(),
        ..Default::default()
    });
    Ok(Arc::new(manager))
}

pub async fn build_state(config: &Config) -> Result<AppState> {
    let secret = config
        .jwt_secret
        .clone()
        .context("JWT_SECRET must be set to serve the API")?;

    let volume = PersistentVolume::open(&config.volume_path)
        .with_context(|| format!("Failed to open volume at {}", config.volume_path.display()))?;
    let manager = build_manager(config, &volume).await?;

    let mut state = AppState::new(
        manager,
        volume,
        Arc::new(JwtVerifier::new(secret, config.jwt_algorithm)),
    )
    .with_settings(config.api_settings());

    match &config.openai_api_key {
        Some(key) => {
            let client = OpenAiClient::new(key.clone()).with_model(&config.completion_model);
            state = state.with_completion(Arc::new(client));
        }
        None => warn!("OPENAI_API_KEY is not set; /sandbox/prompt will answer 503"),
    }

    Ok(state)
}

/// Serve the API until ctrl-c
pub async fn serve(config: Config) -> Result<()> {
    let state = build_state(&config).await?;

    let monitor = ExpiryMonitor::new(state.manager.clone());
    monitor.start().await;

    let app = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(address = %addr, algorithm = %config.jwt_algorithm, "Server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    monitor.stop().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Options for a one-shot run from a local directory
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub path: PathBuf,
    pub exposure: ExposureKind,
    pub timeout: Option<Duration>,
}

pub async fn run_once(config: Config, options: RunOptions) -> Result<RunOutcome> {
    let path = options
        .path
        .canonicalize()
        .with_context(|| format!("Project directory not found: {}", options.path.display()))?;

    let volume = PersistentVolume::open(&config.volume_path)
        .with_context(|| format!("Failed to open volume at {}", config.volume_path.display()))?;
    let manager = build_manager(&config, &volume).await?;

    let mut request = RunRequest::new(
        "cli",
        ImageDescriptor::default_node(),
        ContentSource::LocalPath(path),
        manager.settings(),
    )
    .with_exposure(options.exposure);
    if let Some(timeout) = options.timeout {
        request = request.with_timeout(timeout);
    }

    Ok(manager.provision_and_run(request).await?)
}
