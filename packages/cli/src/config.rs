// ABOUTME: Process configuration read from the environment and an optional .env file
// ABOUTME: Validates ports, secrets and limits before anything starts

use skiff_api::{ApiSettings, AuthError, JwtAlgorithm};
use skiff_config as vars;
use skiff_sandbox::{ImageDescriptor, SandboxSettings};
use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("{0} must be set")]
    MissingSecret(&'static str),
    #[error("Invalid JWT algorithm: {0}")]
    InvalidAlgorithm(#[from] AuthError),
    #[error("Invalid value for {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    /// Always present for `serve`; optional for one-shot runs
    pub jwt_secret: Option<String>,
    pub jwt_algorithm: JwtAlgorithm,
    pub ngrok_authtoken: Option<String>,
    pub openai_api_key: Option<String>,
    pub completion_model: String,
    pub volume_path: PathBuf,
    pub prebuilt_path: PathBuf,
    pub max_upload_mb: usize,
    pub public_host: String,
    pub public_scheme: String,
    pub sandbox_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub record_retention_secs: u64,
}

impl Config {
    /// Configuration for the HTTP server; `JWT_SECRET` is required
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok(), true)
    }

    /// Configuration for commands that never verify tokens
    pub fn from_env_without_auth() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok(), false)
    }

    pub fn from_lookup<F>(lookup: F, require_secret: bool) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get(vars::SKIFF_PORT).or_else(|| get(vars::PORT)) {
            Some(value) => value.trim().parse::<u16>()?,
            None => vars::DEFAULT_PORT,
        };
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let jwt_secret = get(vars::JWT_SECRET);
        if require_secret && jwt_secret.is_none() {
            return Err(ConfigError::MissingSecret(vars::JWT_SECRET));
        }

        let jwt_algorithm = get(vars::JWT_ALGO)
            .unwrap_or_else(|| vars::DEFAULT_JWT_ALGO.to_string())
            .parse::<JwtAlgorithm>()?;

        let public_host = get(vars::SKIFF_PUBLIC_HOST).unwrap_or_else(|| "localhost".to_string());
        let public_scheme = get(vars::SKIFF_PUBLIC_SCHEME).unwrap_or_else(|| "http".to_string());

        Ok(Config {
            host: get(vars::SKIFF_HOST).unwrap_or_else(|| vars::DEFAULT_HOST.to_string()),
            port,
            cors_origin: get(vars::SKIFF_CORS_ORIGIN)
                .or_else(|| get(vars::CORS_ORIGIN))
                .unwrap_or_else(|| vars::DEFAULT_CORS_ORIGIN.to_string()),
            jwt_secret,
            jwt_algorithm,
            ngrok_authtoken: get(vars::NGROK_AUTHTOKEN),
            openai_api_key: get(vars::OPENAI_API_KEY),
            completion_model: get(vars::SKIFF_COMPLETION_MODEL)
                .unwrap_or_else(|| vars::DEFAULT_COMPLETION_MODEL.to_string()),
            volume_path: PathBuf::from(
                get(vars::SKIFF_VOLUME_PATH).unwrap_or_else(|| vars::DEFAULT_VOLUME_PATH.to_string()),
            ),
            prebuilt_path: PathBuf::from(
                get(vars::SKIFF_PREBUILT_PATH)
                    .unwrap_or_else(|| vars::DEFAULT_PREBUILT_PATH.to_string()),
            ),
            max_upload_mb: number(&get, vars::SKIFF_MAX_UPLOAD_MB, vars::DEFAULT_MAX_UPLOAD_MB)?,
            public_host,
            public_scheme,
            sandbox_timeout_secs: number(
                &get,
                vars::SKIFF_SANDBOX_TIMEOUT_SECS,
                vars::DEFAULT_SANDBOX_TIMEOUT_SECS,
            )?,
            monitor_interval_secs: number(
                &get,
                vars::SKIFF_MONITOR_INTERVAL_SECS,
                vars::DEFAULT_MONITOR_INTERVAL_SECS,
            )?,
            record_retention_secs: number(
                &get,
                vars::SKIFF_RECORD_RETENTION_SECS,
                vars::DEFAULT_RECORD_RETENTION_SECS,
            )?,
        })
    }

    /// Lifecycle settings; the volume is mounted into every sandbox from `volume_root`
    pub fn sandbox_settings(&self, volume_root: &std::path::Path) -> SandboxSettings {
        let defaults = SandboxSettings::default();
        SandboxSettings {
            default_timeout_secs: self.sandbox_timeout_secs,
            max_timeout_secs: defaults.max_timeout_secs.max(self.sandbox_timeout_secs),
            monitor_interval_secs: self.monitor_interval_secs,
            retention_secs: self.record_retention_secs,
            volume_host_path: Some(volume_root.display().to_string()),
            ..defaults
        }
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            prebuilt_path: self.prebuilt_path.clone(),
            max_upload_bytes: self.max_upload_mb * 1024 * 1024,
            cors_origin: self.cors_origin.clone(),
            image: ImageDescriptor::default_node(),
        }
    }
}

fn number<F, T>(get: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
{
    match get(var) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<T>() {
            Ok(n) if n > T::default() => Ok(n),
            _ => Err(ConfigError::InvalidNumber { var, value }),
        },
    }
}
