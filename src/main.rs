use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use gourmet::config::Config;
use gourmet::server::GourmetServer;

#[derive(Parser)]
#[command(name = "gourmetd", version, about = "HTTP reverse proxy and load balancer")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long = "config", default_value = "/etc/gourmetd.conf")]
    config: PathBuf,

    /// Path to the access log file
    #[arg(long = "log", default_value = "/var/log/gourmet/access.log")]
    log: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gourmet=info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .await
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    let server = GourmetServer::new(config, Some(&cli.log))
        .await
        .context("failed to initialize server")?;

    if let Err(e) = server.run().await {
        error!("server error: {e}");
        std::process::exit(1);
    }

    Ok(())
}
