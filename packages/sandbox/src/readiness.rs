// ABOUTME: HTTP readiness probing for sandboxed servers
// ABOUTME: Polls an internal address with bounded attempts until it answers 2xx or 3xx

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How hard to try before giving up on a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub interval: Duration,
    #[serde(with = "millis")]
    pub attempt_timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessProber {
    pub fn new() -> Self {
        // Redirects are answers, not something to follow
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    /// Issue `GET http://address:port/` until it answers or the attempts run out.
    ///
    /// Makes at most `policy.max_attempts` requests, sleeping `policy.interval` between them.
    /// Running out of attempts returns `false`; it is not an error.
    pub async fn wait_until_ready(&self, address: &str, port: u16, policy: &ProbePolicy) -> bool {
        let url = format!("http://{}:{}/", address, port);

        for attempt in 1..=policy.max_attempts {
            if self.probe_once(&url, policy.attempt_timeout).await {
                info!(url = %url, attempt, "Server is ready");
                return true;
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }

        warn!(url = %url, attempts = policy.max_attempts, "Server never became ready");
        false
    }

    async fn probe_once(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(url = %url, status = %status, "Probe answered");
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                debug!(url = %url, "Probe failed: {}", e);
                false
            }
        }
    }
}
