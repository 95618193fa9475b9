//! Prometheus exporter for AMD GPU telemetry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use amd_smi_exporter::{
    CommandSource, ExporterConfig, HttpServer, MetricCollector, SmiSource, init_tracing,
};

/// Prometheus exporter for AMD GPU telemetry.
#[derive(Parser, Debug)]
#[command(name = "amd-smi-exporter")]
#[command(about = "Export amd-smi GPU telemetry as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Address to listen on for GPU metrics (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Address to listen on for exporter runtime metrics (overrides config).
    #[arg(long)]
    runtime_listen: Option<String>,

    /// Path under which to expose metrics (overrides config).
    #[arg(long)]
    path: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

fn parse_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", addr, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.web.listen = listen;
    }
    if let Some(runtime_listen) = args.runtime_listen {
        config.web.runtime_listen = Some(runtime_listen);
    }
    if let Some(path) = args.path {
        config.web.path = path;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    config.validate()?;

    init_tracing(&config.logging)?;

    info!("Starting AMD SMI Exporter");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source = CommandSource::new(config.smi.clone());
    info!(
        command = %source.describe(),
        timeout_secs = config.smi.timeout_secs,
        "Using amd-smi source"
    );

    let collector = Arc::new(MetricCollector::new(
        Arc::new(source),
        &config.web,
        &config.filters,
    ));

    let gpu_server = HttpServer::new(
        collector.clone(),
        parse_addr(&config.web.listen)?,
        config.web.path.clone(),
    );
    let runtime_server = match &config.web.runtime_listen {
        Some(addr) => Some(HttpServer::runtime(
            collector.clone(),
            parse_addr(addr)?,
            config.web.path.clone(),
        )),
        None => None,
    };

    let mut tasks = Vec::new();

    let gpu_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = gpu_server.run(gpu_shutdown).await {
            error!("GPU metrics server error: {}", e);
        }
    }));

    if let Some(runtime_server) = runtime_server {
        let runtime_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runtime_server.run(runtime_shutdown).await {
                error!("Runtime metrics server error: {}", e);
            }
        }));
    }

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for servers to drain
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;

    let stats = collector.stats();
    info!(
        scrapes = stats.scrapes,
        scrape_failures = stats.scrape_failures,
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}
