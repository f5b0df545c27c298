// ABOUTME: Skiff entry point library: configuration, logging and server wiring
// ABOUTME: The `skiff` binary is a thin clap layer over these functions

pub mod config;
pub mod server;

#[cfg(test)]
mod tests;

use tracing_subscriber::EnvFilter;

/// Initialise logging from `RUST_LOG`, defaulting to `info`
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}
