use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use wsproxy::Gateway;

use crate::config::Config;

/// Settings shared by the commands that resolve the server configuration.
#[derive(Debug, clap::Args)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Optional password to protect the WebSocket endpoint
    #[arg(long)]
    password: Option<String>,

    /// Seconds to wait for a proxy client to finish a response
    #[arg(long, value_name = "SECS")]
    request_timeout: Option<u64>,

    /// Read settings from this file instead of the user config
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl ServerArgs {
    pub fn resolve(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref()).context("Failed to load config")?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(password) = &self.password {
            config.password = Some(password.clone()).filter(|p| !p.is_empty());
        }
        if let Some(secs) = self.request_timeout {
            config.request_timeout_secs = secs;
        }
        Ok(config)
    }
}

/// Run the public proxy server
#[derive(Debug, clap::Args)]
pub struct Args {
    #[command(flatten)]
    server: ServerArgs,
}

pub async fn execute(args: &Args) -> Result<()> {
    let config = args.server.resolve()?;

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to start server on {addr}"))?;

    info!("Starting WebSocket proxy server on {}", listener.local_addr()?);
    info!(
        "Proxy clients should connect to ws://<host>:{}{}",
        config.port, config.tunnel_path
    );
    if config.password.is_some() {
        info!("Password protection is ENABLED");
    } else {
        info!("Password protection is DISABLED");
    }

    let gateway = Gateway::new(config.tunnel_config());
    tokio::select! {
        result = gateway.serve(listener) => result.context("Server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down server..."),
    }

    Ok(())
}
