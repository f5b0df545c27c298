// ABOUTME: Public exposure of sandbox ports through a platform tunnel or a self-hosted agent
// ABOUTME: Defines the Exposer trait, exposure handles and the per-port handle cache

use crate::providers::{ProviderError, SandboxRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::RwLock;

pub mod agent;
pub mod native;

pub use agent::{AgentConfig, AgentTunnel};
pub use native::NativeTunnel;

/// Shown in place of a URL when the agent never reported one
pub const TUNNEL_NOT_FOUND: &str = "ngrok tunnel not found";

#[derive(Error, Debug)]
pub enum ExposureError {
    #[error("No public endpoint for port {port} of sandbox {sandbox_id}")]
    Unavailable { sandbox_id: String, port: u16 },

    #[error("Tunnel agent setup failed: {0}")]
    AgentSetup(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, ExposureError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureKind {
    Native,
    Agent,
}

impl fmt::Display for ExposureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

impl FromStr for ExposureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "agent" | "ngrok" => Ok(Self::Agent),
            other => Err(format!("unknown exposure kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// The agent reported a public URL for the port
    Connected,
    /// The agent is running but never reported a matching tunnel
    UrlUnresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExposureHandle {
    pub sandbox_id: String,
    pub internal_port: u16,
    pub kind: ExposureKind,
    pub public_host: Option<String>,
    pub public_port: Option<u16>,
    pub url: Option<String>,
    pub agent_state: Option<AgentState>,
}

impl ExposureHandle {
    /// The URL, or the not-found sentinel when the agent never resolved one
    pub fn url_or_sentinel(&self) -> &str {
        self.url.as_deref().unwrap_or(TUNNEL_NOT_FOUND)
    }
}

/// Establishes a public path to a sandbox port. Repeated calls for the same
/// sandbox and port return the first handle.
#[async_trait]
pub trait Exposer: Send + Sync {
    fn kind(&self) -> ExposureKind;

    async fn expose(&self, sandbox: &SandboxRef, internal_port: u16) -> Result<ExposureHandle>;

    /// Drop cached handles for a sandbox that has been torn down
    async fn forget(&self, sandbox_id: &str);
}

/// Handles keyed by (sandbox id, internal port)
#[derive(Default)]
pub(crate) struct HandleCache {
    handles: RwLock<HashMap<(String, u16), ExposureHandle>>,
}

impl HandleCache {
    pub(crate) async fn get(&self, sandbox_id: &str, port: u16) -> Option<ExposureHandle> {
        self.handles
            .read()
            .await
            .get(&(sandbox_id.to_string(), port))
            .cloned()
    }

    pub(crate) async fn insert(&self, handle: ExposureHandle) -> ExposureHandle {
        let mut handles = self.handles.write().await;
        handles
            .entry((handle.sandbox_id.clone(), handle.internal_port))
            .or_insert(handle)
            .clone()
    }

    pub(crate) async fn forget(&self, sandbox_id: &str) {
        self.handles
            .write()
            .await
            .retain(|(id, _), _| id != sandbox_id);
    }
}
