// ABOUTME: Declarative image descriptors describing a sandbox's base environment
// ABOUTME: Builds immutable content-keyed recipes and caches the images built from them

use crate::providers::{Provider, ProviderError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Repository name used for every image built from a descriptor
pub const IMAGE_REPOSITORY: &str = "skiff-image";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Invalid base image: {0}")]
    InvalidBase(String),

    #[error("Invalid image step {index}: {reason}")]
    InvalidStep { index: usize, reason: String },

    #[error("Image build failed: {0}")]
    Build(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// One ordered step of an image recipe
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageStep {
    /// Install OS packages with the system package manager
    SystemPackages { packages: Vec<String> },
    /// Run a shell command at build time
    Run { command: String },
    /// Set an environment variable for later steps and for the sandbox
    Env { key: String, value: String },
}

impl ImageStep {
    fn validate(&self, index: usize) -> Result<()> {
        let invalid = |reason: &str| ImageError::InvalidStep {
            index,
            reason: reason.to_string(),
        };

        match self {
            ImageStep::SystemPackages { packages } => {
                if packages.is_empty() {
                    return Err(invalid("package list is empty"));
                }
                for package in packages {
                    if package.trim().is_empty() {
                        return Err(invalid("package name is empty"));
                    }
                    if package.chars().any(char::is_whitespace) {
                        return Err(invalid(&format!(
                            "package name '{}' contains whitespace",
                            package
                        )));
                    }
                }
            }
            ImageStep::Run { command } => {
                if command.trim().is_empty() {
                    return Err(invalid("command is empty"));
                }
                if command.contains('\n') {
                    return Err(invalid("command spans multiple lines"));
                }
            }
            ImageStep::Env { key, .. } => {
                if key.is_empty() || key.contains('=') || key.chars().any(char::is_whitespace) {
                    return Err(invalid(&format!("invalid environment key '{}'", key)));
                }
            }
        }

        Ok(())
    }

    fn to_dockerfile_line(&self) -> String {
        match self {
            ImageStep::SystemPackages { packages } => format!(
                "RUN apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
                packages.join(" ")
            ),
            ImageStep::Run { command } => format!("RUN {}", command),
            ImageStep::Env { key, value } => format!(
                "ENV {}={}",
                key,
                serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
            ),
        }
    }
}

/// Immutable recipe for a sandbox base environment.
///
/// Two descriptors built from the same base and the same ordered steps share the same
/// [`key`](ImageDescriptor::key), which is what the registry and the platform cache on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDescriptor {
    base: String,
    steps: Vec<ImageStep>,
    key: String,
}

impl ImageDescriptor {
    pub fn builder(base: impl Into<String>) -> ImageDescriptorBuilder {
        ImageDescriptorBuilder {
            base: base.into(),
            steps: Vec::new(),
        }
    }

    /// Validate the steps and derive the content key
    pub fn build(base: impl Into<String>, steps: Vec<ImageStep>) -> Result<Self> {
        let base = base.into();
        if base.trim().is_empty() || base.chars().any(char::is_whitespace) {
            return Err(ImageError::InvalidBase(base));
        }

        for (index, step) in steps.iter().enumerate() {
            step.validate(index)?;
        }

        let key = content_key(&base, &steps);
        Ok(Self { base, steps, key })
    }

    /// Debian slim with curl, unzip, wget, git and Node.js 20
    pub fn default_node() -> Self {
        let base = "debian:bookworm-slim".to_string();
        let steps = vec![
            ImageStep::SystemPackages {
                packages: ["ca-certificates", "curl", "unzip", "wget", "git"]
                    .map(String::from)
                    .to_vec(),
            },
            ImageStep::Run {
                command: "curl -fsSL https://deb.nodesource.com/setup_20.x | bash -".to_string(),
            },
            ImageStep::Run {
                command: "apt-get install -y nodejs".to_string(),
            },
        ];
        let key = content_key(&base, &steps);
        Self { base, steps, key }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn steps(&self) -> &[ImageStep] {
        &self.steps
    }

    /// Lowercase hex SHA-256 of the canonical recipe
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn tag(&self) -> String {
        format!("{}:{}", IMAGE_REPOSITORY, &self.key[..16])
    }

    pub fn to_dockerfile(&self) -> String {
        let mut dockerfile = format!("FROM {}\n", self.base);
        for step in &self.steps {
            dockerfile.push_str(&step.to_dockerfile_line());
            dockerfile.push('\n');
        }
        dockerfile
    }
}

fn content_key(base: &str, steps: &[ImageStep]) -> String {
    #[derive(Serialize)]
    struct Canonical<'a> {
        base: &'a str,
        steps: &'a [ImageStep],
    }

    let canonical = serde_json::to_vec(&Canonical { base, steps })
        .expect("image steps always serialize");
    format!("{:x}", Sha256::digest(&canonical))
}

pub struct ImageDescriptorBuilder {
    base: String,
    steps: Vec<ImageStep>,
}

impl ImageDescriptorBuilder {
    pub fn apt_install<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(ImageStep::SystemPackages {
            packages: packages.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn run_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for command in commands {
            self.steps.push(ImageStep::Run {
                command: command.into(),
            });
        }
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.steps.push(ImageStep::Env {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn build(self) -> Result<ImageDescriptor> {
        ImageDescriptor::build(self.base, self.steps)
    }
}

/// Builds each distinct descriptor at most once and remembers the resulting tag
pub struct ImageRegistry {
    provider: Arc<dyn Provider>,
    built: RwLock<HashMap<String, String>>,
}

impl ImageRegistry {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            built: RwLock::new(HashMap::new()),
        }
    }

    /// Return the image tag for a descriptor, building it on the platform if needed
    pub async fn ensure(&self, descriptor: &ImageDescriptor) -> Result<String> {
        if let Some(tag) = self.built.read().await.get(descriptor.key()) {
            debug!(key = %descriptor.key(), tag = %tag, "Image found in registry cache");
            return Ok(tag.clone());
        }

        let tag = descriptor.tag();
        if self.provider.image_exists(&tag).await? {
            debug!(tag = %tag, "Image already present on platform");
        } else {
            info!(tag = %tag, base = %descriptor.base(), steps = descriptor.steps().len(), "Building image");
            self.provider.build_image(descriptor).await?;
        }

        self.built
            .write()
            .await
            .insert(descriptor.key().to_string(), tag.clone());
        Ok(tag)
    }

    pub async fn is_cached(&self, descriptor: &ImageDescriptor) -> bool {
        self.built.read().await.contains_key(descriptor.key())
    }
}
