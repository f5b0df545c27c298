// ABOUTME: Sandbox lifecycle orchestration for on-demand preview environments
// ABOUTME: Images, content provisioning, process supervision, readiness, exposure and teardown

pub mod archive;
pub mod exposure;
pub mod image;
pub mod manager;
pub mod monitor;
pub mod providers;
pub mod provision;
pub mod readiness;
pub mod settings;
pub mod storage;
pub mod supervisor;
pub mod volume;

pub use exposure::{
    AgentConfig, AgentState, ExposureError, ExposureHandle, ExposureKind, Exposer,
    TUNNEL_NOT_FOUND,
};
pub use image::{ImageDescriptor, ImageError, ImageRegistry, ImageStep};
pub use manager::{
    LifecycleError, ManagerError, RunOutcome, RunRequest, RunWarning, SandboxManager, Stage,
    StageError,
};
pub use monitor::ExpiryMonitor;
pub use providers::{DockerProvider, Provider, ProviderError, SandboxRef};
pub use provision::{ContentProvisioner, ContentSource, ProvisionError, ProvisionedContent};
pub use readiness::{ProbePolicy, ReadinessProber};
pub use settings::{SandboxSettings, SettingsError};
pub use storage::{Sandbox, SandboxState, SandboxStorage, StorageError};
pub use supervisor::{Liveness, ProcessKind, ProcessSupervisor, SupervisedProcess, SupervisorError};
pub use volume::{PersistentVolume, VolumeError};
