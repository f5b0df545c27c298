// ABOUTME: Docker provider implementation for local container-based sandboxes
// ABOUTME: Uses bollard to build images, run self-expiring containers and publish ports

use super::{
    ContainerConfig, ContainerInfo, ContainerStatus, Endpoint, ExecResult, ExecState, Provider,
    ProviderError, PublicEndpoint, Result,
};
use crate::archive::single_file_tar;
use crate::image::ImageDescriptor;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::{BuildImageOptions, CreateImageOptions},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const LABEL_PREFIX: &str = "skiff.sandbox";

pub struct DockerProvider {
    client: Docker,
    label_prefix: String,
    /// Host name clients use to reach published ports
    public_host: String,
    public_scheme: String,
    /// Images pulled by this provider, keyed by reference
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    /// Timeout for image pulls and builds (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Connect using `DOCKER_HOST` or the local socket
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            label_prefix: LABEL_PREFIX.to_string(),
            public_host: "localhost".to_string(),
            public_scheme: "http".to_string(),
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: Duration::from_secs(600),
        }
    }

    /// Host and scheme used when building public URLs for published ports
    pub fn with_public_address(mut self, host: impl Into<String>, scheme: impl Into<String>) -> Self {
        self.public_host = host.into();
        self.public_scheme = scheme.into();
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Convert our config to bollard config.
    ///
    /// PID 1 is `sleep <lifetime>` and the container is auto-removed, so the daemon reclaims
    /// the sandbox at its deadline whether or not anyone calls `remove_container`.
    fn to_bollard_config(&self, config: &ContainerConfig) -> Config<String> {
        let mut labels = config.labels.clone();
        labels.insert(format!("{}.managed", self.label_prefix), "true".to_string());
        labels.insert(format!("{}.name", self.label_prefix), config.name.clone());

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        for port in &config.ports {
            let container_port = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            let binding = vec![bollard::models::PortBinding {
                host_ip: Some(port.host_ip.clone()),
                // None lets the daemon pick a free port
                host_port: (port.host_port != 0).then(|| port.host_port.to_string()),
            }];
            port_bindings.insert(container_port, Some(binding));
        }

        let binds: Vec<String> = config
            .volumes
            .iter()
            .map(|v| {
                format!(
                    "{}:{}:{}",
                    v.host_path,
                    v.container_path,
                    if v.readonly { "ro" } else { "rw" }
                )
            })
            .collect();

        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            binds: Some(binds),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            auto_remove: Some(true),
            init: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            entrypoint: Some(vec!["sleep".to_string()]),
            cmd: Some(vec![config.lifetime.as_secs().max(1).to_string()]),
            env: Some(env),
            working_dir: config.working_dir.clone(),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Convert bollard container status to our status
    fn convert_status(state: &str) -> ContainerStatus {
        match state.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Running,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Stopped,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Error(format!("Unknown status: {}", state)),
        }
    }

    fn public_endpoint(&self, host_port: u16) -> PublicEndpoint {
        PublicEndpoint {
            host: self.public_host.clone(),
            port: host_port,
            url: format!("{}://{}:{}", self.public_scheme, self.public_host, host_port),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) && self.image_exists(image).await? {
            debug!(image = %image, "Image found in cache, skipping pull");
            return Ok(());
        }

        info!(image = %image, timeout = ?self.pull_timeout, "Pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(Ok(())) => {
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn create_exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        working_dir: Option<String>,
        env_vars: Option<HashMap<String, String>>,
        attach: bool,
    ) -> Result<String> {
        let env: Option<Vec<String>> = env_vars.map(|vars| {
            vars.into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect()
        });

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            env,
            working_dir,
            attach_stdout: Some(attach),
            attach_stderr: Some(attach),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| container_error(container_id, e))?;
        Ok(exec.id)
    }

    async fn exec_checked(&self, container_id: &str, command: Vec<String>) -> Result<()> {
        let description = command.join(" ");
        let result = self.exec_command(container_id, command, None, None).await?;
        if result.exit_code != 0 {
            return Err(ProviderError::ContainerError(format!(
                "'{}' exited with {}: {}",
                description,
                result.exit_code,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn upload(&self, container_id: &str, dest_dir: &str, tar: Vec<u8>) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(container_id, Some(options), tar.into())
            .await
            .map_err(|e| container_error(container_id, e))
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn container_error(container_id: &str, err: bollard::errors::Error) -> ProviderError {
    if is_not_found(&err) {
        ProviderError::NotFound(container_id.to_string())
    } else {
        ProviderError::ContainerError(err.to_string())
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn build_image(&self, descriptor: &ImageDescriptor) -> Result<String> {
        let tag = descriptor.tag();
        self.pull_image(descriptor.base()).await?;

        let context = single_file_tar("Dockerfile", descriptor.to_dockerfile().as_bytes())
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.clone(),
            rm: true,
            forcerm: true,
            labels: HashMap::from([(format!("{}.image-key", self.label_prefix), descriptor.key().to_string())]),
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(context.into()));

        let built = tokio::time::timeout(self.pull_timeout, async {
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| ProviderError::ImageError(e.to_string()))?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to build image {}: {}",
                        tag, error
                    )));
                }
                if let Some(line) = info.stream.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
                    debug!(tag = %tag, "{}", line);
                }
            }
            Ok(())
        })
        .await;

        match built {
            Ok(Ok(())) => {
                info!(tag = %tag, "Built image");
                Ok(tag)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout building image {} after {:?}",
                tag, self.pull_timeout
            ))),
        }
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        info!(name = %config.name, image = %config.image, lifetime = ?config.lifetime, "Creating container");

        if !self.image_exists(&config.image).await? {
            self.pull_image(&config.image).await?;
        }

        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), self.to_bollard_config(config))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| container_error(&container.id, e))?;

        Ok(container.id)
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Gone already, or auto-removal is in progress
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo> {
        let inspect = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| container_error(container_id, e))?;

        let state = inspect.state.as_ref().ok_or_else(|| {
            ProviderError::ContainerError("Container has no state information".to_string())
        })?;

        let status = Self::convert_status(
            state
                .status
                .as_ref()
                .map(|s| s.as_ref())
                .unwrap_or("unknown"),
        );

        let mut ports = HashMap::new();
        if let Some(port_map) = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref())
        {
            for (container_port_str, bindings) in port_map {
                // Container port format: "3000/tcp"
                let host_port = bindings
                    .as_ref()
                    .and_then(|b| b.first())
                    .and_then(|b| b.host_port.as_ref())
                    .and_then(|p| p.parse::<u16>().ok());
                let container_port = container_port_str
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
                if let (Some(container_port), Some(host_port)) = (container_port, host_port) {
                    ports.insert(container_port, host_port);
                }
            }
        }

        let created_at = inspect
            .created
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let started_at = state
            .started_at
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(ContainerInfo {
            id: container_id.to_string(),
            name: inspect
                .name
                .unwrap_or_else(|| container_id.to_string())
                .trim_start_matches('/')
                .to_string(),
            status,
            ip_address: inspect
                .network_settings
                .and_then(|ns| ns.ip_address)
                .filter(|s| !s.is_empty()),
            ports,
            created_at,
            started_at,
        })
    }

    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        working_dir: Option<String>,
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecResult> {
        debug!(container = %container_id, command = ?command, "Executing command");

        let exec_id = self
            .create_exec(container_id, command, working_dir, env_vars, true)
            .await?;

        let start_result = self
            .client
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| container_error(container_id, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::ContainerError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let state = self.exec_state(&exec_id).await?;

        Ok(ExecResult {
            exit_code: state.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }

    async fn exec_detached(
        &self,
        container_id: &str,
        command: Vec<String>,
        working_dir: Option<String>,
    ) -> Result<String> {
        info!(container = %container_id, command = ?command, "Starting detached command");

        let exec_id = self
            .create_exec(container_id, command, working_dir, None, false)
            .await?;

        let options = StartExecOptions {
            detach: true,
            ..Default::default()
        };

        self.client
            .start_exec(&exec_id, Some(options))
            .await
            .map_err(|e| container_error(container_id, e))?;

        Ok(exec_id)
    }

    async fn exec_state(&self, exec_id: &str) -> Result<ExecState> {
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| container_error(exec_id, e))?;

        Ok(ExecState {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }

    async fn write_file(&self, container_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        let path = Path::new(path);
        let (parent, name) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => (parent.to_string_lossy(), name.to_string_lossy()),
            _ => {
                return Err(ProviderError::ConfigError(format!(
                    "Not a file path: {}",
                    path.display()
                )))
            }
        };

        self.exec_checked(
            container_id,
            vec!["mkdir".to_string(), "-p".to_string(), parent.to_string()],
        )
        .await?;

        let tar = single_file_tar(&name, contents)
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;
        self.upload(container_id, &parent, tar).await
    }

    async fn remove_path(&self, container_id: &str, path: &str) -> Result<()> {
        self.exec_checked(
            container_id,
            vec!["rm".to_string(), "-rf".to_string(), path.to_string()],
        )
        .await
    }

    async fn upload_tar(&self, container_id: &str, dest_dir: &str, tar: Vec<u8>) -> Result<()> {
        debug!(container = %container_id, dest = %dest_dir, bytes = tar.len(), "Uploading tar");
        self.exec_checked(
            container_id,
            vec!["mkdir".to_string(), "-p".to_string(), dest_dir.to_string()],
        )
        .await?;
        self.upload(container_id, dest_dir, tar).await
    }

    async fn internal_endpoint(&self, container_id: &str, port: u16) -> Result<Endpoint> {
        let info = self.get_container_info(container_id).await?;

        // Bridge IPs are routable from a Linux host; fall back to the published port otherwise
        if let Some(ip) = info.ip_address {
            return Ok(Endpoint { host: ip, port });
        }
        match info.ports.get(&port) {
            Some(host_port) => Ok(Endpoint {
                host: "127.0.0.1".to_string(),
                port: *host_port,
            }),
            None => Err(ProviderError::NetworkError(format!(
                "Container {} has no address for port {}",
                container_id, port
            ))),
        }
    }

    async fn tunnel_endpoint(
        &self,
        container_id: &str,
        port: u16,
    ) -> Result<Option<PublicEndpoint>> {
        let info = self.get_container_info(container_id).await?;
        Ok(info
            .ports
            .get(&port)
            .map(|host_port| self.public_endpoint(*host_port)))
    }
}
