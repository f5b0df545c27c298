// ABOUTME: Environment variable name constants and their defaults
// ABOUTME: Centralized definitions of every environment variable read by Skiff

// Server Configuration
pub const SKIFF_PORT: &str = "SKIFF_PORT";
pub const SKIFF_HOST: &str = "SKIFF_HOST";
pub const PORT: &str = "PORT"; // Legacy

// CORS Configuration
pub const SKIFF_CORS_ORIGIN: &str = "SKIFF_CORS_ORIGIN";
pub const CORS_ORIGIN: &str = "CORS_ORIGIN"; // Legacy

// Token Verification
pub const JWT_SECRET: &str = "JWT_SECRET";
pub const JWT_ALGO: &str = "JWT_ALGO";

// Tunnel Agent
pub const NGROK_AUTHTOKEN: &str = "NGROK_AUTHTOKEN";

// Compute Platform (read by bollard itself)
pub const DOCKER_HOST: &str = "DOCKER_HOST";
pub const SKIFF_PUBLIC_HOST: &str = "SKIFF_PUBLIC_HOST";
pub const SKIFF_PUBLIC_SCHEME: &str = "SKIFF_PUBLIC_SCHEME";

// Completion Service
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const SKIFF_COMPLETION_MODEL: &str = "SKIFF_COMPLETION_MODEL";

// Storage and Projects
pub const SKIFF_VOLUME_PATH: &str = "SKIFF_VOLUME_PATH";
pub const SKIFF_PREBUILT_PATH: &str = "SKIFF_PREBUILT_PATH";
pub const SKIFF_MAX_UPLOAD_MB: &str = "SKIFF_MAX_UPLOAD_MB";

// Sandbox Lifecycle
pub const SKIFF_SANDBOX_TIMEOUT_SECS: &str = "SKIFF_SANDBOX_TIMEOUT_SECS";
pub const SKIFF_MONITOR_INTERVAL_SECS: &str = "SKIFF_MONITOR_INTERVAL_SECS";
pub const SKIFF_RECORD_RETENTION_SECS: &str = "SKIFF_RECORD_RETENTION_SECS";

// Defaults
pub const DEFAULT_PORT: u16 = 4001;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";
pub const DEFAULT_JWT_ALGO: &str = "HS256";
pub const DEFAULT_COMPLETION_MODEL: &str = "gpt-4.1";
pub const DEFAULT_VOLUME_PATH: &str = "./skiff-volume";
pub const DEFAULT_PREBUILT_PATH: &str = "../prebuilt";
pub const DEFAULT_MAX_UPLOAD_MB: usize = 100;
pub const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_RECORD_RETENTION_SECS: u64 = 3600;
