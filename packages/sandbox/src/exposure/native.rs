// ABOUTME: Native platform tunnel exposure
// ABOUTME: Asks the provider for the public endpoint it assigned to a sandbox port

use super::{ExposureError, ExposureHandle, ExposureKind, Exposer, HandleCache, Result};
use crate::providers::{Provider, SandboxRef};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct NativeTunnel {
    provider: Arc<dyn Provider>,
    cache: HandleCache,
}

impl NativeTunnel {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            cache: HandleCache::default(),
        }
    }
}

#[async_trait]
impl Exposer for NativeTunnel {
    fn kind(&self) -> ExposureKind {
        ExposureKind::Native
    }

    async fn expose(&self, sandbox: &SandboxRef, internal_port: u16) -> Result<ExposureHandle> {
        if let Some(handle) = self.cache.get(&sandbox.sandbox_id, internal_port).await {
            return Ok(handle);
        }

        let endpoint = self
            .provider
            .tunnel_endpoint(&sandbox.container_id, internal_port)
            .await?
            .ok_or_else(|| ExposureError::Unavailable {
                sandbox_id: sandbox.sandbox_id.clone(),
                port: internal_port,
            })?;

        info!(sandbox_id = %sandbox.sandbox_id, port = internal_port, url = %endpoint.url, "Exposed port");

        Ok(self
            .cache
            .insert(ExposureHandle {
                sandbox_id: sandbox.sandbox_id.clone(),
                internal_port,
                kind: ExposureKind::Native,
                public_host: Some(endpoint.host),
                public_port: Some(endpoint.port),
                url: Some(endpoint.url),
                agent_state: None,
            })
            .await)
    }

    async fn forget(&self, sandbox_id: &str) {
        self.cache.forget(sandbox_id).await;
    }
}
