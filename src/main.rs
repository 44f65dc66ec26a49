use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use graylog_mcp::config::{Config, ServerMode};
use graylog_mcp::graylog::GraylogClient;
use graylog_mcp::http::serve_http;
use graylog_mcp::mcp::run_stdio;
use graylog_mcp::tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the stdio transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(p) => format!("loading configuration from {}", p.display()),
        None => "loading configuration from environment".to_string(),
    })?;

    let client = GraylogClient::new(&config.graylog).context("building Graylog client")?;
    let tools = Arc::new(ToolRegistry::new(Arc::new(client), config.limits.clone()));
    info!(mode = ?config.server.mode, "starting graylog-mcp");

    match config.server.mode {
        ServerMode::Stdio => run_stdio(tools).await?,
        ServerMode::Http => serve_http(&config.server.bind, tools).await?,
        ServerMode::Both => {
            let bind = config.server.bind.clone();
            let http_tools = tools.clone();
            let http_task = tokio::spawn(async move { serve_http(&bind, http_tools).await });
            // The process lives as long as the stdio client; the HTTP side
            // only ends early on failure.
            tokio::select! {
                res = run_stdio(tools) => res?,
                res = http_task => res.context("http task panicked")??,
            }
        }
    }

    Ok(())
}
