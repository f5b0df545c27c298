// ABOUTME: Sandbox lifecycle manager driving image, create, provision, start, probe and expose
// ABOUTME: Owns sandbox records, tears sandboxes down on failure and reconciles expired ones

use crate::exposure::{
    AgentConfig, AgentState, AgentTunnel, ExposureError, ExposureHandle, ExposureKind, Exposer,
    NativeTunnel,
};
use crate::image::{ImageDescriptor, ImageError, ImageRegistry};
use crate::providers::{ContainerConfig, PortMapping, Provider, ProviderError, SandboxRef, VolumeMount};
use crate::provision::{ContentProvisioner, ContentSource, ProvisionError, ProvisionedContent};
use crate::readiness::ReadinessProber;
use crate::settings::SandboxSettings;
use crate::storage::{MountRecord, Sandbox, SandboxState, SandboxStorage, StorageError};
use crate::supervisor::{ProcessSupervisor, SupervisedProcess, SupervisorError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Lifecycle stages, in the order a run goes through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Image,
    Create,
    Provisioning,
    Setup,
    Start,
    Probe,
    Exposure,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Create => "create",
            Self::Provisioning => "provisioning",
            Self::Setup => "setup",
            Self::Start => "start",
            Self::Probe => "probe",
            Self::Exposure => "exposure",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Exposure(#[from] ExposureError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A run that stopped at `stage`
#[derive(Error, Debug)]
#[error("{stage} stage failed for sandbox {sandbox_id}: {source}")]
pub struct LifecycleError {
    pub stage: Stage,
    pub sandbox_id: String,
    /// False only when the sandbox was left running (exposure failures)
    pub torn_down: bool,
    #[source]
    pub source: StageError,
}

/// Non-fatal problems reported with a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    ReadinessTimeout { attempts: u32 },
    TunnelNotFound,
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadinessTimeout { attempts } => write!(
                f,
                "server did not answer after {} readiness probes",
                attempts
            ),
            Self::TunnelNotFound => f.write_str(crate::exposure::TUNNEL_NOT_FOUND),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub owner_id: String,
    pub image: ImageDescriptor,
    pub source: ContentSource,
    pub setup_commands: Vec<String>,
    pub start_command: String,
    pub port: u16,
    pub timeout: Duration,
    pub exposure: ExposureKind,
    pub env_vars: HashMap<String, String>,
}

impl RunRequest {
    /// A request using the settings' image-independent defaults
    pub fn new(
        owner_id: impl Into<String>,
        image: ImageDescriptor,
        source: ContentSource,
        settings: &SandboxSettings,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            image,
            source,
            setup_commands: settings.setup_commands.clone(),
            start_command: settings.start_command.clone(),
            port: settings.app_port,
            timeout: settings.default_timeout(),
            exposure: settings.default_exposure,
            env_vars: HashMap::new(),
        }
    }

    pub fn with_exposure(mut self, exposure: ExposureKind) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_commands(mut self, setup_commands: Vec<String>, start_command: impl Into<String>) -> Self {
        self.setup_commands = setup_commands;
        self.start_command = start_command.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub sandbox: Sandbox,
    pub content: ProvisionedContent,
    pub server: SupervisedProcess,
    pub exposure: ExposureHandle,
    pub warnings: Vec<RunWarning>,
}

impl RunOutcome {
    pub fn url(&self) -> Option<&str> {
        self.exposure.url.as_deref()
    }
}

pub struct SandboxManager {
    provider: Arc<dyn Provider>,
    settings: SandboxSettings,
    storage: SandboxStorage,
    images: ImageRegistry,
    provisioner: ContentProvisioner,
    supervisor: ProcessSupervisor,
    prober: ReadinessProber,
    exposers: HashMap<ExposureKind, Arc<dyn Exposer>>,
    agent_status_port: u16,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn Provider>, settings: SandboxSettings) -> Self {
        let mut exposers: HashMap<ExposureKind, Arc<dyn Exposer>> = HashMap::new();
        exposers.insert(
            ExposureKind::Native,
            Arc::new(NativeTunnel::new(provider.clone())),
        );
        let agent = AgentConfig::default();
        let agent_status_port = agent.status_port;
        exposers.insert(
            ExposureKind::Agent,
            Arc::new(AgentTunnel::new(provider.clone(), agent)),
        );

        Self {
            images: ImageRegistry::new(provider.clone()),
            provisioner: ContentProvisioner::new(provider.clone()),
            supervisor: ProcessSupervisor::new(provider.clone()),
            prober: ReadinessProber::new(),
            storage: SandboxStorage::new(),
            exposers,
            agent_status_port,
            settings,
            provider,
        }
    }

    /// Replace the agent tunnel configuration
    pub fn with_agent(mut self, config: AgentConfig) -> Self {
        self.agent_status_port = config.status_port;
        let agent = Arc::new(AgentTunnel::new(self.provider.clone(), config));
        self.with_exposer(agent)
    }

    /// Register (or replace) the exposer for its kind
    pub fn with_exposer(mut self, exposer: Arc<dyn Exposer>) -> Self {
        self.exposers.insert(exposer.kind(), exposer);
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Run every stage for one request.
    ///
    /// Failures before the server is up tear the sandbox down. A readiness timeout only adds a
    /// warning. An exposure failure leaves the sandbox running and reports its id.
    pub async fn provision_and_run(
        &self,
        request: RunRequest,
    ) -> std::result::Result<RunOutcome, LifecycleError> {
        let sandbox_id = uuid::Uuid::new_v4().to_string();
        let timeout = self.settings.clamp_timeout(Some(request.timeout));

        let mut record = Sandbox::new(
            &sandbox_id,
            &request.owner_id,
            self.provider.name(),
            timeout.as_secs(),
        );
        record.ports = vec![request.port];
        record.image_key = Some(request.image.key().to_string());
        if let Some(host_path) = &self.settings.volume_host_path {
            record.mounts.push(MountRecord {
                source: host_path.clone(),
                target: self.settings.volume_mount_path.clone(),
                persistent: true,
            });
        }
        self.storage
            .insert(record)
            .await
            .map_err(|e| self.fail(Stage::Create, &sandbox_id, false, e))?;

        info!(
            sandbox_id = %sandbox_id,
            owner = %request.owner_id,
            exposure = %request.exposure,
            timeout_secs = timeout.as_secs(),
            "Starting sandbox run"
        );

        // Image
        let tag = match self.images.ensure(&request.image).await {
            Ok(tag) => tag,
            Err(e) => return Err(self.abort(Stage::Image, &sandbox_id, None, e).await),
        };

        // Create
        let config = self.container_config(&sandbox_id, &request, &tag, timeout);
        let container_id = match self.provider.create_container(&config).await {
            Ok(id) => id,
            Err(e) => return Err(self.abort(Stage::Create, &sandbox_id, None, e).await),
        };
        let sandbox = SandboxRef::new(&sandbox_id, &container_id);
        let recorded = self
            .storage
            .update(&sandbox_id, |s| {
                s.image_tag = Some(tag.clone());
                s.container_id = Some(container_id.clone());
            })
            .await;
        if let Err(e) = recorded {
            return Err(self.abort(Stage::Create, &sandbox_id, Some(&container_id), e).await);
        }

        // Provision
        let content = match self.provision_stage(&sandbox, request.source).await {
            Ok(content) => content,
            Err(e) => {
                return Err(self
                    .abort(Stage::Provisioning, &sandbox_id, Some(&container_id), e)
                    .await)
            }
        };

        // Setup, then detached start
        if let Err(e) = self.storage.transition(&sandbox_id, SandboxState::Starting).await {
            return Err(self.abort(Stage::Setup, &sandbox_id, Some(&container_id), e).await);
        }
        let workdir = self.settings.workdir.as_str();
        for command in &request.setup_commands {
            if let Err(e) = self
                .supervisor
                .run_to_completion(&sandbox, command, Some(workdir))
                .await
            {
                return Err(self.abort(Stage::Setup, &sandbox_id, Some(&container_id), e).await);
            }
        }
        let server = match self
            .supervisor
            .run_detached(&sandbox, &request.start_command, Some(workdir))
            .await
        {
            Ok(process) => process,
            Err(e) => return Err(self.abort(Stage::Start, &sandbox_id, Some(&container_id), e).await),
        };

        // Probe
        if let Err(e) = self.storage.transition(&sandbox_id, SandboxState::Probing).await {
            return Err(self.abort(Stage::Probe, &sandbox_id, Some(&container_id), e).await);
        }
        let mut warnings = Vec::new();
        if !self.probe_stage(&sandbox, request.port).await {
            warnings.push(RunWarning::ReadinessTimeout {
                attempts: self.settings.probe.max_attempts,
            });
        }

        // Expose
        let exposure = match self.expose_stage(&sandbox, request.exposure, request.port).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, "Exposure failed, sandbox left running: {}", e);
                let message = e.to_string();
                if let Err(e) = self
                    .storage
                    .update(&sandbox_id, |s| s.last_error = Some(message))
                    .await
                {
                    warn!(sandbox_id = %sandbox_id, "Failed to record exposure error: {}", e);
                }
                return Err(self.fail(Stage::Exposure, &sandbox_id, false, e));
            }
        };
        if exposure.agent_state == Some(AgentState::UrlUnresolved) {
            warnings.push(RunWarning::TunnelNotFound);
        }

        let sandbox_record = match self.finish(&sandbox_id, &exposure).await {
            Ok(record) => record,
            Err(e) => return Err(self.fail(Stage::Exposure, &sandbox_id, false, e)),
        };

        info!(
            sandbox_id = %sandbox_id,
            url = exposure.url_or_sentinel(),
            warnings = warnings.len(),
            "Sandbox running"
        );

        Ok(RunOutcome {
            sandbox: sandbox_record,
            content,
            server,
            exposure,
            warnings,
        })
    }

    async fn provision_stage(
        &self,
        sandbox: &SandboxRef,
        source: ContentSource,
    ) -> std::result::Result<ProvisionedContent, StageError> {
        self.storage
            .transition(&sandbox.sandbox_id, SandboxState::Provisioning)
            .await?;
        Ok(self
            .provisioner
            .provision(source, sandbox, &self.settings.workdir)
            .await?)
    }

    /// Probe the internal address; an unknown address counts as not ready
    async fn probe_stage(&self, sandbox: &SandboxRef, port: u16) -> bool {
        let endpoint = match self
            .provider
            .internal_endpoint(&sandbox.container_id, port)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(sandbox_id = %sandbox.sandbox_id, "No internal address to probe: {}", e);
                return false;
            }
        };

        let address = format!("{}:{}", endpoint.host, endpoint.port);
        if let Err(e) = self
            .storage
            .update(&sandbox.sandbox_id, |s| s.internal_address = Some(address))
            .await
        {
            warn!(sandbox_id = %sandbox.sandbox_id, "Failed to record internal address: {}", e);
        }

        self.prober
            .wait_until_ready(&endpoint.host, endpoint.port, &self.settings.probe)
            .await
    }

    async fn expose_stage(
        &self,
        sandbox: &SandboxRef,
        kind: ExposureKind,
        port: u16,
    ) -> std::result::Result<ExposureHandle, StageError> {
        let exposer = self.exposers.get(&kind).ok_or_else(|| {
            ProviderError::ConfigError(format!("exposure '{}' is not configured", kind))
        })?;
        Ok(exposer.expose(sandbox, port).await?)
    }

    async fn finish(
        &self,
        sandbox_id: &str,
        exposure: &ExposureHandle,
    ) -> std::result::Result<Sandbox, StorageError> {
        let url = exposure.url.clone();
        let kind = exposure.kind;
        self.storage
            .update(sandbox_id, |s| {
                s.public_url = url;
                s.exposure = Some(kind);
            })
            .await?;
        self.storage
            .transition(sandbox_id, SandboxState::Exposed)
            .await?;
        self.storage
            .transition(sandbox_id, SandboxState::Running)
            .await
    }

    fn container_config(
        &self,
        sandbox_id: &str,
        request: &RunRequest,
        image: &str,
        lifetime: Duration,
    ) -> ContainerConfig {
        let volumes = self
            .settings
            .volume_host_path
            .iter()
            .map(|host_path| VolumeMount {
                host_path: host_path.clone(),
                container_path: self.settings.volume_mount_path.clone(),
                readonly: false,
            })
            .collect();

        let mut ports = vec![PortMapping::tcp(request.port)];
        if request.exposure == ExposureKind::Agent {
            // The agent's status API must stay off public interfaces
            ports.push(PortMapping::loopback(self.agent_status_port));
        }

        ContainerConfig {
            image: image.to_string(),
            name: format!("skiff-{}", &sandbox_id[..12.min(sandbox_id.len())]),
            env_vars: request.env_vars.clone(),
            volumes,
            ports,
            working_dir: None,
            labels: HashMap::from([
                ("skiff.sandbox.id".to_string(), sandbox_id.to_string()),
                ("skiff.sandbox.owner".to_string(), request.owner_id.clone()),
            ]),
            lifetime,
        }
    }

    /// Tear the sandbox down and build the error for `stage`
    async fn abort(
        &self,
        stage: Stage,
        sandbox_id: &str,
        container_id: Option<&str>,
        source: impl Into<StageError>,
    ) -> LifecycleError {
        let source = source.into();
        error!(sandbox_id = %sandbox_id, stage = %stage, "Sandbox run failed: {}", source);
        self.teardown(sandbox_id, container_id, Some(format!("{} failed: {}", stage, source)))
            .await;
        self.fail(stage, sandbox_id, true, source)
    }

    fn fail(
        &self,
        stage: Stage,
        sandbox_id: &str,
        torn_down: bool,
        source: impl Into<StageError>,
    ) -> LifecycleError {
        LifecycleError {
            stage,
            sandbox_id: sandbox_id.to_string(),
            torn_down,
            source: source.into(),
        }
    }

    async fn teardown(&self, sandbox_id: &str, container_id: Option<&str>, reason: Option<String>) {
        if let Some(container_id) = container_id {
            if let Err(e) = self.provider.remove_container(container_id, true).await {
                warn!(sandbox_id = %sandbox_id, "Failed to remove container {}: {}", container_id, e);
            }
        }
        for exposer in self.exposers.values() {
            exposer.forget(sandbox_id).await;
        }
        if let Err(e) = self.storage.terminate(sandbox_id, reason).await {
            warn!(sandbox_id = %sandbox_id, "Failed to mark sandbox terminated: {}", e);
        }
    }

    /// Explicitly tear down a sandbox owned by `owner_id`
    pub async fn stop_sandbox(&self, sandbox_id: &str, owner_id: &str) -> Result<Sandbox> {
        let sandbox = self.owned(sandbox_id, owner_id).await?;
        if !sandbox.state.is_terminal() {
            info!(sandbox_id = %sandbox_id, "Stopping sandbox");
            self.teardown(sandbox_id, sandbox.container_id.as_deref(), None)
                .await;
        }
        Ok(self.storage.get(sandbox_id).await?)
    }

    /// Fetch a record, marking it terminated first if its deadline has passed
    pub async fn get_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        let sandbox = self.storage.get(sandbox_id).await.map_err(not_found)?;
        if !sandbox.state.is_terminal() && sandbox.is_expired(Utc::now()) {
            self.expire(&sandbox).await;
            return Ok(self.storage.get(sandbox_id).await?);
        }
        Ok(sandbox)
    }

    /// `get_sandbox`, hiding records that belong to someone else
    pub async fn get_owned_sandbox(&self, sandbox_id: &str, owner_id: &str) -> Result<Sandbox> {
        self.owned(sandbox_id, owner_id).await
    }

    pub async fn list_sandboxes(&self, owner_id: Option<&str>) -> Vec<Sandbox> {
        self.sweep_expired().await;
        self.storage.list(owner_id).await
    }

    /// Reconcile every record past its deadline and drop terminated records past retention;
    /// returns how many were terminated
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.storage.expired(Utc::now()).await;
        for sandbox in &expired {
            self.expire(sandbox).await;
        }

        let cutoff = chrono::Duration::from_std(self.settings.retention())
            .map(|retention| Utc::now() - retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pruned = self.storage.prune_terminated(cutoff).await;
        if pruned > 0 {
            debug!(pruned, "Dropped terminated sandbox records past retention");
        }

        expired.len()
    }

    async fn expire(&self, sandbox: &Sandbox) {
        info!(sandbox_id = %sandbox.id, deadline = %sandbox.deadline, "Sandbox reached its deadline");
        // The platform reclaims the container itself; removal here is best effort
        self.teardown(
            &sandbox.id,
            sandbox.container_id.as_deref(),
            Some("deadline reached".to_string()),
        )
        .await;
    }

    async fn owned(&self, sandbox_id: &str, owner_id: &str) -> Result<Sandbox> {
        let sandbox = self.get_sandbox(sandbox_id).await?;
        if sandbox.owner_id != owner_id {
            return Err(ManagerError::NotFound(sandbox_id.to_string()));
        }
        Ok(sandbox)
    }
}

fn not_found(err: StorageError) -> ManagerError {
    match err {
        StorageError::NotFound(id) => ManagerError::NotFound(id),
        other => ManagerError::Storage(other),
    }
}
