// ABOUTME: Command line interface for Skiff
// ABOUTME: `skiff serve` runs the HTTP API and `skiff run` launches one sandbox from a directory

use clap::{Parser, Subcommand};
use colored::*;
use skiff_cli::config::Config;
use skiff_cli::server::{self, RunOptions};
use skiff_sandbox::ExposureKind;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Skiff - on-demand preview sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Override SKIFF_PORT
        #[arg(long)]
        port: Option<u16>,
        /// Override SKIFF_HOST
        #[arg(long)]
        host: Option<String>,
    },
    /// Run a project directory in a new sandbox and print its URL
    Run {
        #[arg(long, help = "Project directory to copy into the sandbox")]
        path: PathBuf,
        #[arg(long, help = "Expose through the ngrok agent instead of the platform tunnel")]
        ngrok: bool,
        #[arg(long, help = "Sandbox lifetime in seconds")]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    skiff_cli::init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve { port, host } => serve(port, host).await,
        Commands::Run {
            path,
            ngrok,
            timeout,
        } => run(path, ngrok, timeout).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn serve(port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(host) = host {
        config.host = host;
    }
    server::serve(config).await
}

async fn run(path: PathBuf, ngrok: bool, timeout: Option<u64>) -> anyhow::Result<()> {
    let config = Config::from_env_without_auth()?;
    let exposure = if ngrok {
        ExposureKind::Agent
    } else {
        ExposureKind::Native
    };

    println!("{} {}", "Launching sandbox for".cyan(), path.display());
    let outcome = server::run_once(
        config,
        RunOptions {
            path,
            exposure,
            timeout: timeout.map(Duration::from_secs),
        },
    )
    .await?;

    println!("{} {}", "Sandbox:".bold(), outcome.sandbox.id);
    println!("{} {}", "URL:".bold(), outcome.exposure.url_or_sentinel().green());
    println!(
        "{} {}",
        "Expires:".bold(),
        outcome.sandbox.deadline.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for warning in &outcome.warnings {
        println!("{} {}", "Warning:".yellow().bold(), warning);
    }
    Ok(())
}
