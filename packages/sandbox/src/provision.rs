// ABOUTME: Content provisioning that fills a sandbox with project files
// ABOUTME: Copies a local tree, extracts an uploaded zip or tarball or clones a repository, replacing the target

use crate::archive::{create_tar_archive, validate_archive, ArchiveError, ArchiveFormat};
use crate::providers::{Provider, ProviderError, SandboxRef};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Invalid target path: {0}")]
    InvalidTarget(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl ProvisionError {
    /// Stable cause name reported alongside provisioning failures
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceNotFound(_) => "source_not_found",
            Self::CorruptArchive(_) => "corrupt_archive",
            Self::Fetch { .. } => "fetch_error",
            Self::InvalidTarget(_) => "invalid_target",
            Self::Io(_) => "io_error",
            Self::Provider(_) => "platform_error",
        }
    }
}

impl From<ArchiveError> for ProvisionError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(e) => ProvisionError::Io(e),
            other => ProvisionError::CorruptArchive(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Where project content comes from
#[derive(Debug, Clone)]
pub enum ContentSource {
    LocalPath(PathBuf),
    Archive {
        bytes: Vec<u8>,
        filename: Option<String>,
    },
    Repository {
        url: String,
        reference: Option<String>,
    },
}

impl ContentSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::LocalPath(_) => SourceKind::Local,
            Self::Archive { .. } => SourceKind::Archive,
            Self::Repository { .. } => SourceKind::Repository,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    Archive,
    Repository,
}

/// Project tree now present inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedContent {
    pub source: SourceKind,
    pub target_path: String,
}

pub struct ContentProvisioner {
    provider: Arc<dyn Provider>,
}

impl ContentProvisioner {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Apply exactly one source to `target_path`, replacing whatever was there
    pub async fn provision(
        &self,
        source: ContentSource,
        sandbox: &SandboxRef,
        target_path: &str,
    ) -> Result<ProvisionedContent> {
        match source {
            ContentSource::LocalPath(path) => self.copy_local(&path, sandbox, target_path).await,
            ContentSource::Archive { bytes, filename } => {
                debug!(filename = ?filename, bytes = bytes.len(), "Provisioning from archive");
                self.extract_archive(&bytes, sandbox, target_path).await
            }
            ContentSource::Repository { url, reference } => {
                self.clone_repository(&url, reference.as_deref(), sandbox, target_path)
                    .await
            }
        }
    }

    pub async fn copy_local(
        &self,
        source_path: &Path,
        sandbox: &SandboxRef,
        target_path: &str,
    ) -> Result<ProvisionedContent> {
        check_target(target_path)?;
        if !source_path.exists() {
            return Err(ProvisionError::SourceNotFound(
                source_path.display().to_string(),
            ));
        }

        info!(
            sandbox_id = %sandbox.sandbox_id,
            source = %source_path.display(),
            target = %target_path,
            "Copying local project"
        );

        let source = source_path.to_path_buf();
        let tar = tokio::task::spawn_blocking(move || create_tar_archive(&source))
            .await
            .map_err(|e| ProviderError::InternalError(e.to_string()))??;

        self.provider
            .remove_path(&sandbox.container_id, target_path)
            .await?;
        self.provider
            .upload_tar(&sandbox.container_id, target_path, tar)
            .await?;

        Ok(ProvisionedContent {
            source: SourceKind::Local,
            target_path: target_path.to_string(),
        })
    }

    /// Validate a zip file or gzip tarball locally, then unpack it inside the sandbox.
    ///
    /// The temporary upload is removed whether or not extraction succeeds.
    pub async fn extract_archive(
        &self,
        bytes: &[u8],
        sandbox: &SandboxRef,
        target_path: &str,
    ) -> Result<ProvisionedContent> {
        check_target(target_path)?;
        let summary = validate_archive(bytes)?;

        info!(
            sandbox_id = %sandbox.sandbox_id,
            entries = summary.entries,
            format = ?summary.format,
            target = %target_path,
            "Extracting project archive"
        );

        let container = &sandbox.container_id;
        let tmp_path = format!(
            "/tmp/skiff-upload-{}.{}",
            uuid::Uuid::new_v4(),
            summary.format.extension()
        );

        self.provider.remove_path(container, target_path).await?;
        self.provider.write_file(container, &tmp_path, bytes).await?;

        let extracted = self
            .unpack_remote(container, summary.format, &tmp_path, target_path)
            .await;

        if let Err(e) = self.provider.remove_path(container, &tmp_path).await {
            warn!(sandbox_id = %sandbox.sandbox_id, path = %tmp_path, "Failed to remove upload: {}", e);
        }

        extracted?;
        Ok(ProvisionedContent {
            source: SourceKind::Archive,
            target_path: target_path.to_string(),
        })
    }

    async fn unpack_remote(
        &self,
        container: &str,
        format: ArchiveFormat,
        archive: &str,
        target_path: &str,
    ) -> Result<()> {
        let mkdir = self
            .provider
            .exec_command(container, argv(&["mkdir", "-p", target_path]), None, None)
            .await?;
        if mkdir.exit_code != 0 {
            return Err(ProviderError::ContainerError(format!(
                "mkdir {} exited with {}",
                target_path, mkdir.exit_code
            ))
            .into());
        }

        let command = unpack_command(format, archive, target_path);
        let result = self
            .provider
            .exec_command(container, command.clone(), None, None)
            .await?;
        if result.exit_code != 0 {
            return Err(ProvisionError::CorruptArchive(format!(
                "{} exited with {}: {}",
                command[0],
                result.exit_code,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Shallow-clone `url` at `reference` (default branch when `None`)
    pub async fn clone_repository(
        &self,
        url: &str,
        reference: Option<&str>,
        sandbox: &SandboxRef,
        target_path: &str,
    ) -> Result<ProvisionedContent> {
        check_target(target_path)?;
        if url.trim().is_empty() {
            return Err(ProvisionError::SourceNotFound("empty repository url".to_string()));
        }

        info!(sandbox_id = %sandbox.sandbox_id, url = %url, reference = ?reference, "Cloning repository");

        let container = &sandbox.container_id;
        self.provider.remove_path(container, target_path).await?;

        let result = self
            .provider
            .exec_command(container, clone_command(url, reference, target_path), None, None)
            .await?;
        if result.exit_code != 0 {
            return Err(ProvisionError::Fetch {
                url: url.to_string(),
                reason: format!(
                    "git exited with {}: {}",
                    result.exit_code,
                    String::from_utf8_lossy(&result.stderr).trim()
                ),
            });
        }

        Ok(ProvisionedContent {
            source: SourceKind::Repository,
            target_path: target_path.to_string(),
        })
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn unpack_command(format: ArchiveFormat, archive: &str, target_path: &str) -> Vec<String> {
    match format {
        ArchiveFormat::GzipTar => argv(&["tar", "-xzf", archive, "-C", target_path]),
        ArchiveFormat::Zip => argv(&["unzip", "-o", "-q", archive, "-d", target_path]),
    }
}

fn clone_command(url: &str, reference: Option<&str>, target_path: &str) -> Vec<String> {
    let mut command = argv(&["git", "clone", "--depth", "1"]);
    if let Some(reference) = reference.filter(|r| !r.is_empty()) {
        command.push("--branch".to_string());
        command.push(reference.to_string());
    }
    command.push(url.to_string());
    command.push(target_path.to_string());
    command
}

/// Targets are absolute, never the root, and never climb with `..`
fn check_target(target_path: &str) -> Result<()> {
    let path = Path::new(target_path);
    let climbs = path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));
    if !path.is_absolute() || path.parent().is_none() || climbs {
        return Err(ProvisionError::InvalidTarget(target_path.to_string()));
    }
    Ok(())
}
