//! Prometheus exporter for AMD GPU telemetry.
//!
//! On every scrape the exporter runs `amd-smi metric --json`, maps the
//! per-GPU readings it reports into labeled gauges and serves them over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │     amd-smi     │────>│    Collector    │────>│   HTTP Server   │
//! │  (JSON stdout)  │     │ (extract + map) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! A second listener serves the exporter's own scrape statistics.
//!
//! # Usage
//!
//! ```bash
//! amd-smi-exporter --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod collector;
pub mod config;
pub mod error;
pub mod extract;
pub mod http;
pub mod mapping;
pub mod source;

pub use collector::{CollectorStats, MetricCollector, SharedCollector};
pub use config::{ExporterConfig, LogFormat, LoggingConfig};
pub use error::{CycleError, SourceError};
pub use http::HttpServer;
pub use mapping::{Family, MetricFamilies};
pub use source::{CommandSource, SmiSource, StaticSource};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}
