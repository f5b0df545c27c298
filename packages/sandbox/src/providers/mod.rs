// ABOUTME: Provider trait and shared types for sandbox compute backends
// ABOUTME: Abstract capabilities (image build, create, file injection, exec, exposure, teardown)

use crate::image::ImageDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// A live sandbox as the stage components see it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxRef {
    pub sandbox_id: String,
    pub container_id: String,
}

impl SandboxRef {
    pub fn new(sandbox_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            container_id: container_id.into(),
        }
    }
}

/// Container configuration for creating sandboxes
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub env_vars: HashMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortMapping>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    /// Absolute lifetime; the platform reclaims the sandbox once it elapses
    pub lifetime: Duration,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone)]
pub struct PortMapping {
    /// 0 lets the platform pick a free host port
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String, // tcp or udp
    /// Host interface the port is published on
    pub host_ip: String,
}

impl PortMapping {
    pub fn tcp(container_port: u16) -> Self {
        Self {
            host_port: 0,
            container_port,
            protocol: "tcp".to_string(),
            host_ip: "0.0.0.0".to_string(),
        }
    }

    /// Published on the host's loopback interface only
    pub fn loopback(container_port: u16) -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            ..Self::tcp(container_port)
        }
    }
}

/// Container runtime information
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub ip_address: Option<String>,
    pub ports: HashMap<u16, u16>, // container_port -> host_port
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Removing,
    Dead,
    Error(String),
}

/// Execution result from running a command in a container
#[derive(Debug)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Observed state of a detached exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Address the orchestrator uses to reach a port inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Publicly routable address the platform assigned to a sandbox port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicEndpoint {
    pub host: String,
    pub port: u16,
    pub url: String,
}

/// Provider trait for sandbox container/VM backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short backend name used in logs and sandbox records
    fn name(&self) -> &str;

    /// Check if the provider is available and configured correctly
    async fn is_available(&self) -> Result<bool>;

    /// Check if an image exists on the platform
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Build the image described by `descriptor` and return its tag
    async fn build_image(&self, descriptor: &ImageDescriptor) -> Result<String>;

    /// Create and start a new container that self-terminates after `config.lifetime`
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    /// Remove a container. Removing a container that is already gone succeeds.
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    /// Get container information; `ProviderError::NotFound` once the container is gone
    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo>;

    /// Execute a command in a running container and wait for it to exit
    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        working_dir: Option<String>,
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecResult>;

    /// Start a command in a running container without waiting for it; returns an exec id
    async fn exec_detached(
        &self,
        container_id: &str,
        command: Vec<String>,
        working_dir: Option<String>,
    ) -> Result<String>;

    /// Inspect a detached exec
    async fn exec_state(&self, exec_id: &str) -> Result<ExecState>;

    /// Write a single file, creating parent directories
    async fn write_file(&self, container_id: &str, path: &str, contents: &[u8]) -> Result<()>;

    /// Recursively remove a path; a missing path is not an error
    async fn remove_path(&self, container_id: &str, path: &str) -> Result<()>;

    /// Unpack an uncompressed tar stream into `dest_dir`, creating it if needed
    async fn upload_tar(&self, container_id: &str, dest_dir: &str, tar: Vec<u8>) -> Result<()>;

    /// Internal address of a container port, reachable from the orchestrator
    async fn internal_endpoint(&self, container_id: &str, port: u16) -> Result<Endpoint>;

    /// Platform-native public endpoint for a container port, if the platform exposes one
    async fn tunnel_endpoint(&self, container_id: &str, port: u16)
        -> Result<Option<PublicEndpoint>>;
}
