use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use servlet_cgi::config::Config;
use servlet_cgi::servlets::{builtin_factories, default_routes};
use servlet_cgi::transport::ListenAddress;
use servlet_cgi::Service;

/// FastCGI responder dispatching requests to servlets by path prefix.
#[derive(Parser)]
#[command(name = "servlet-cgi", version, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address: host:port, unix:/path or stdin
    #[arg(short, long)]
    listen: Option<ListenAddress>,

    /// Number of worker tasks
    #[arg(short, long)]
    workers: Option<usize>,

    /// Requests waiting for a worker before accepting pauses
    #[arg(long)]
    queue_bound: Option<usize>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("cannot install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("cannot wait for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.service.listen = listen;
    }
    if let Some(workers) = cli.workers {
        config.service.workers = workers;
    }
    if let Some(queue_bound) = cli.queue_bound {
        config.service.queue_bound = queue_bound;
    }
    if config.routes.is_empty() {
        config.routes = default_routes();
    }

    let factories = builtin_factories().context("failed to register servlet factories")?;
    let mut service = Service::new(
        config.settings(),
        factories,
        config.routes.clone(),
        Box::new(config.listener()),
    );
    service.start().await.context("failed to start service")?;

    let waited = shutdown_signal().await;
    info!("shutting down");
    service.stop().await;
    waited
}
