// ABOUTME: Self-hosted ngrok agent exposure running inside the sandbox
// ABOUTME: Installs and authenticates the agent, starts it detached and reads its status API

use super::{AgentState, ExposureError, ExposureHandle, ExposureKind, Exposer, HandleCache, Result};
use crate::providers::{Provider, SandboxRef};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_AGENT_DOWNLOAD_URL: &str =
    "https://bin.equinox.io/c/bNyj1mQVY4c/ngrok-v3-stable-linux-amd64.tgz";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Auth token; the agent runs unauthenticated without one
    pub authtoken: Option<String>,
    pub download_url: String,
    pub install_dir: String,
    pub status_port: u16,
    pub status_attempts: u32,
    pub status_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            authtoken: None,
            download_url: DEFAULT_AGENT_DOWNLOAD_URL.to_string(),
            install_dir: "/usr/local/bin".to_string(),
            status_port: 4040,
            status_attempts: 10,
            status_interval: Duration::from_secs(1),
        }
    }
}

impl AgentConfig {
    fn binary(&self) -> String {
        format!("{}/ngrok", self.install_dir.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<Tunnel>,
}

#[derive(Debug, Deserialize)]
struct Tunnel {
    public_url: String,
    #[serde(default)]
    proto: String,
    #[serde(default)]
    config: TunnelConfig,
}

#[derive(Debug, Default, Deserialize)]
struct TunnelConfig {
    #[serde(default)]
    addr: String,
}

pub struct AgentTunnel {
    provider: Arc<dyn Provider>,
    client: reqwest::Client,
    config: AgentConfig,
    cache: HandleCache,
}

impl AgentTunnel {
    pub fn new(provider: Arc<dyn Provider>, config: AgentConfig) -> Self {
        Self {
            provider,
            client: reqwest::Client::new(),
            config,
            cache: HandleCache::default(),
        }
    }

    async fn ensure_installed(&self, sandbox: &SandboxRef) -> Result<()> {
        let binary = self.config.binary();
        let check = self
            .provider
            .exec_command(
                &sandbox.container_id,
                vec!["test".to_string(), "-x".to_string(), binary.clone()],
                None,
                None,
            )
            .await?;
        if check.exit_code == 0 {
            debug!(sandbox_id = %sandbox.sandbox_id, "Tunnel agent already installed");
            return Ok(());
        }

        info!(sandbox_id = %sandbox.sandbox_id, "Installing tunnel agent");
        let script = format!(
            "wget -q {url} -O /tmp/ngrok.tgz && tar -xzf /tmp/ngrok.tgz -C {dir} && rm -f /tmp/ngrok.tgz",
            url = self.config.download_url,
            dir = self.config.install_dir,
        );
        self.run_step(sandbox, vec!["sh".to_string(), "-c".to_string(), script], "install")
            .await
    }

    async fn authenticate(&self, sandbox: &SandboxRef) -> Result<()> {
        let Some(token) = self.config.authtoken.as_deref() else {
            return Ok(());
        };
        self.run_step(
            sandbox,
            vec![
                self.config.binary(),
                "config".to_string(),
                "add-authtoken".to_string(),
                token.to_string(),
            ],
            "authenticate",
        )
        .await
    }

    async fn run_step(&self, sandbox: &SandboxRef, command: Vec<String>, step: &str) -> Result<()> {
        let result = self
            .provider
            .exec_command(&sandbox.container_id, command, None, None)
            .await?;
        if result.exit_code != 0 {
            warn!(
                sandbox_id = %sandbox.sandbox_id,
                step,
                code = result.exit_code,
                "Tunnel agent step failed: {}",
                String::from_utf8_lossy(&result.stderr).trim()
            );
            return Err(ExposureError::AgentSetup(format!(
                "{} exited with code {}",
                step, result.exit_code
            )));
        }
        Ok(())
    }

    /// Poll the agent's status API; an unreachable agent is an unresolved URL, not an error
    async fn resolve_url(&self, sandbox: &SandboxRef, port: u16) -> Option<String> {
        let status = match self
            .provider
            .internal_endpoint(&sandbox.container_id, self.config.status_port)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(
                    sandbox_id = %sandbox.sandbox_id,
                    status_port = self.config.status_port,
                    "No address for the tunnel agent status API: {}",
                    e
                );
                return None;
            }
        };
        let url = format!("http://{}:{}/api/tunnels", status.host, status.port);

        for attempt in 1..=self.config.status_attempts {
            tokio::time::sleep(self.config.status_interval).await;

            let list = match self.client.get(&url).send().await {
                Ok(response) => response.json::<TunnelList>().await,
                Err(e) => Err(e),
            };
            match list {
                Ok(list) => {
                    if let Some(public_url) = pick_tunnel(&list.tunnels, port) {
                        return Some(public_url);
                    }
                    debug!(attempt, "Tunnel agent has no matching tunnel yet");
                }
                Err(e) => debug!(attempt, "Tunnel agent status unavailable: {}", e),
            }
        }

        None
    }
}

/// Prefer an https tunnel forwarding to `port`, then any tunnel forwarding to it
fn pick_tunnel(tunnels: &[Tunnel], port: u16) -> Option<String> {
    let suffix = format!(":{}", port);
    let bare = port.to_string();
    let forwards = |t: &&Tunnel| t.config.addr.ends_with(&suffix) || t.config.addr == bare;

    tunnels
        .iter()
        .filter(forwards)
        .find(|t| t.proto == "https")
        .or_else(|| tunnels.iter().find(forwards))
        .map(|t| t.public_url.clone())
}

#[async_trait]
impl Exposer for AgentTunnel {
    fn kind(&self) -> ExposureKind {
        ExposureKind::Agent
    }

    async fn expose(&self, sandbox: &SandboxRef, internal_port: u16) -> Result<ExposureHandle> {
        if let Some(handle) = self.cache.get(&sandbox.sandbox_id, internal_port).await {
            return Ok(handle);
        }

        self.ensure_installed(sandbox).await?;
        self.authenticate(sandbox).await?;

        let command = vec![
            self.config.binary(),
            "http".to_string(),
            internal_port.to_string(),
            "--web-addr".to_string(),
            format!("0.0.0.0:{}", self.config.status_port),
            "--log".to_string(),
            "stdout".to_string(),
        ];
        self.provider
            .exec_detached(&sandbox.container_id, command, None)
            .await
            .map_err(|e| ExposureError::AgentSetup(e.to_string()))?;

        let url = self.resolve_url(sandbox, internal_port).await;
        let agent_state = match &url {
            Some(url) => {
                info!(sandbox_id = %sandbox.sandbox_id, port = internal_port, url = %url, "Agent tunnel connected");
                AgentState::Connected
            }
            None => {
                warn!(sandbox_id = %sandbox.sandbox_id, port = internal_port, "Agent tunnel URL not found");
                AgentState::UrlUnresolved
            }
        };

        let public_host = url
            .as_deref()
            .and_then(|u| reqwest::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(str::to_string));

        Ok(self
            .cache
            .insert(ExposureHandle {
                sandbox_id: sandbox.sandbox_id.clone(),
                internal_port,
                kind: ExposureKind::Agent,
                public_host,
                public_port: None,
                url,
                agent_state: Some(agent_state),
            })
            .await)
    }

    async fn forget(&self, sandbox_id: &str) {
        self.cache.forget(sandbox_id).await;
    }
}
