//! MCP 2.0 DHCP server - main executable.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use argh::FromArgs;
use cloudcontrol::CloudControlClient;
use mcp_dhcp_server::config::Config;
use mcp_dhcp_server::service::Service;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs, Debug)]
#[argh(description = "DHCP/DNS server for CloudControl-managed machines: answers DHCP from the \
cloud inventory instead of an address pool, with PXE/iPXE boot chaining.")]
struct Args {
    #[argh(
        option,
        short = 'c',
        description = "path to the configuration file (default: ./mcp-dhcp-server.toml, then /etc/mcp-dhcp-server.toml)"
    )]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let config = Config::load(args.config.as_deref())?;

    let default_level = if config.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("MCP 2.0 DHCP server {}", env!("CARGO_PKG_VERSION"));

    let compute = Arc::new(
        CloudControlClient::new(&config.mcp.region, &config.mcp.user, &config.mcp.password)
            .context("failed to create CloudControl client")?,
    );

    info!("Server is initialising...");
    let service = Service::initialize(config, compute).await?;

    info!("Server is starting...");
    service.start().await?;

    info!("Server is running.");
    tokio::signal::ctrl_c().await.context("failed to wait for shutdown signal")?;

    info!("Server is stopping...");
    service.stop().await?;

    Ok(())
}
