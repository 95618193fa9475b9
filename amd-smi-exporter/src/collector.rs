//! Collection cycles and Prometheus exposition of GPU metrics.

use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::{FamilyFilter, FilterConfig, WebConfig};
use crate::error::CycleError;
use crate::mapping::{
    Family, MetricFamilies, build_metric_name, map_document, sanitize_metric_name,
};
use crate::source::SmiSource;

/// Collector statistics.
#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    /// Collection cycles run, including ones cancelled before finishing.
    pub scrapes: u64,
    /// Cycles that ended with an empty exposition because of an error.
    pub scrape_failures: u64,
    /// Whether the most recent cycle succeeded.
    pub last_scrape_success: bool,
    /// Wall time of the most recent cycle.
    pub last_scrape_duration: Duration,
    /// Distinct GPUs with at least one sample in the most recent cycle.
    pub devices: usize,
}

impl CollectorStats {
    /// Number of cycles that completed without error.
    pub fn successful_scrapes(&self) -> u64 {
        self.scrapes - self.scrape_failures
    }
}

/// Turns a decoded document into families. Normally [`map_document`].
type Mapper = fn(&Value) -> Result<MetricFamilies, CycleError>;

/// Runs collection cycles against an amd-smi source and holds their result.
///
/// Cycles are serialized: a cycle clears every family, fetches and maps a
/// fresh document, then installs the result. Readers of [`render`] only
/// ever see a cleared or a fully populated set.
///
/// [`render`]: MetricCollector::render
pub struct MetricCollector {
    source: Arc<dyn SmiSource>,
    mapper: Mapper,
    /// Held for the duration of a cycle.
    cycle: Mutex<()>,
    families: RwLock<MetricFamilies>,
    filter: FamilyFilter,
    prefix: String,
    stats: RwLock<CollectorStats>,
    /// Process metrics served on the runtime listener.
    process_registry: Registry,
}

impl MetricCollector {
    /// Create a new metric collector.
    pub fn new(
        source: Arc<dyn SmiSource>,
        web_config: &WebConfig,
        filter_config: &FilterConfig,
    ) -> Self {
        Self {
            source,
            mapper: map_document,
            cycle: Mutex::new(()),
            families: RwLock::new(MetricFamilies::new()),
            filter: FamilyFilter::new(filter_config),
            prefix: web_config.prefix.clone(),
            stats: RwLock::new(CollectorStats::default()),
            process_registry: process_registry(),
        }
    }

    #[cfg(test)]
    fn with_mapper(mut self, mapper: Mapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Run one collection cycle. Returns the number of samples now exposed.
    pub async fn collect(&self) -> Result<usize, CycleError> {
        let _guard = self.cycle.lock().await;
        self.run_cycle().await
    }

    /// Run one collection cycle and render its result.
    ///
    /// A failed cycle renders as an empty exposition.
    pub async fn scrape(&self) -> String {
        let _guard = self.cycle.lock().await;
        // Failures are logged and counted by the cycle itself.
        let _ = self.run_cycle().await;
        self.render()
    }

    async fn run_cycle(&self) -> Result<usize, CycleError> {
        // Recorded on drop, so a cycle cancelled mid-fetch still counts as failed.
        let mut record = CycleRecord::start(&self.stats);
        self.families.write().clear();

        let result = self.fetch_and_map().await;
        let elapsed = record.started.elapsed();

        match result {
            Ok(mut families) => {
                families.retain_families(|family| self.filter.includes(family));
                let samples = families.len();
                let devices = families.device_count();
                *self.families.write() = families;

                debug!(
                    samples,
                    devices,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Collection cycle complete"
                );
                record.succeed(devices);
                Ok(samples)
            }
            Err(e) => {
                error!(
                    source = %self.source.describe(),
                    error = %e,
                    "Collection cycle failed"
                );
                Err(e)
            }
        }
    }

    async fn fetch_and_map(&self) -> Result<MetricFamilies, CycleError> {
        let bytes = self.source.fetch().await?;
        debug!(bytes = bytes.len(), "Received amd-smi output");
        trace!(raw = %String::from_utf8_lossy(&bytes), "Raw amd-smi output");

        // Mapping runs on its own task so a panic on unexpected input is
        // contained to this cycle.
        let mapper = self.mapper;
        tokio::task::spawn_blocking(move || -> Result<MetricFamilies, CycleError> {
            let document: Value = serde_json::from_slice(&bytes)?;
            mapper(&document)
        })
        .await
        .map_err(|e| CycleError::Panicked(e.to_string()))?
    }

    /// Get collector statistics.
    pub fn stats(&self) -> CollectorStats {
        self.stats.read().clone()
    }

    /// Number of samples currently exposed.
    pub fn series_count(&self) -> usize {
        self.families.read().len()
    }

    /// Snapshot of the currently exposed families.
    pub fn families(&self) -> MetricFamilies {
        self.families.read().clone()
    }

    /// Render the current GPU metrics in Prometheus exposition format.
    ///
    /// Families without samples are omitted entirely.
    pub fn render(&self) -> String {
        let families = self.families.read();
        let mut output = String::with_capacity(families.len() * 64);

        for family in Family::ALL {
            if families.family_len(family) == 0 {
                continue;
            }

            let name = build_metric_name(&self.prefix, family);
            writeln!(output, "# HELP {} {}", name, family.help()).ok();
            writeln!(output, "# TYPE {} gauge", name).ok();

            for (key, value) in families.family(family) {
                writeln!(
                    output,
                    "{}{{gpu=\"{}\",type=\"{}\"}} {}",
                    name,
                    escape_label_value(&key.gpu),
                    escape_label_value(key.sub_type),
                    format_value(value)
                )
                .ok();
            }
        }

        output
    }

    /// Render the exporter's own metrics in Prometheus exposition format.
    pub fn render_runtime(&self) -> String {
        let stats = self.stats();
        let series = self.series_count();
        let prefix = sanitize_metric_name(&self.prefix);
        let prefix = if prefix.is_empty() {
            "exporter".to_string()
        } else {
            format!("{}_exporter", prefix)
        };

        let mut output = String::with_capacity(1024);
        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            writeln!(output, "# HELP {}_{} {}", prefix, name, help).ok();
            writeln!(output, "# TYPE {}_{} {}", prefix, name, kind).ok();
            writeln!(output, "{}_{} {}", prefix, name, value).ok();
        };

        metric(
            "scrapes_total",
            "counter",
            "Collection cycles run",
            stats.scrapes.to_string(),
        );
        metric(
            "scrape_failures_total",
            "counter",
            "Collection cycles that failed",
            stats.scrape_failures.to_string(),
        );
        metric(
            "last_scrape_success",
            "gauge",
            "Whether the last collection cycle succeeded",
            u8::from(stats.last_scrape_success).to_string(),
        );
        metric(
            "last_scrape_duration_seconds",
            "gauge",
            "Duration of the last collection cycle",
            format_value(stats.last_scrape_duration.as_secs_f64()),
        );
        metric(
            "devices",
            "gauge",
            "GPUs reported by the last collection cycle",
            stats.devices.to_string(),
        );
        metric(
            "series",
            "gauge",
            "GPU metric series currently exposed",
            series.to_string(),
        );

        let mut buffer = Vec::new();
        match TextEncoder::new().encode(&self.process_registry.gather(), &mut buffer) {
            Ok(()) => output.push_str(&String::from_utf8_lossy(&buffer)),
            Err(e) => warn!(error = %e, "Failed to encode process metrics"),
        }

        output
    }
}

/// Outcome of one collection cycle, written to the stats when dropped.
struct CycleRecord<'a> {
    stats: &'a RwLock<CollectorStats>,
    started: Instant,
    /// Devices seen, once the cycle has succeeded.
    devices: Option<usize>,
}

impl<'a> CycleRecord<'a> {
    fn start(stats: &'a RwLock<CollectorStats>) -> Self {
        Self {
            stats,
            started: Instant::now(),
            devices: None,
        }
    }

    fn succeed(&mut self, devices: usize) {
        self.devices = Some(devices);
    }
}

impl Drop for CycleRecord<'_> {
    fn drop(&mut self) {
        let mut stats = self.stats.write();
        stats.scrapes += 1;
        stats.last_scrape_duration = self.started.elapsed();
        match self.devices {
            Some(devices) => {
                stats.last_scrape_success = true;
                stats.devices = devices;
            }
            None => {
                stats.scrape_failures += 1;
                stats.last_scrape_success = false;
                stats.devices = 0;
            }
        }
    }
}

/// Registry holding the process collector, where the platform supports one.
fn process_registry() -> Registry {
    let registry = Registry::new();

    #[cfg(target_os = "linux")]
    {
        use prometheus::process_collector::ProcessCollector;
        if let Err(e) = registry.register(Box::new(ProcessCollector::for_self())) {
            warn!(error = %e, "Failed to register process collector");
        }
    }

    registry
}

/// Create a shareable collector handle.
pub type SharedCollector = Arc<MetricCollector>;

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::source::StaticSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    const SINGLE_GPU: &str = r#"[{
        "gpu": 0,
        "usage": {
            "gfx_activity": {"value": 0, "unit": "%"},
            "umc_activity": {"value": 2, "unit": "%"}
        },
        "power": {"socket_power": {"value": 41, "unit": "W"}},
        "temperature": {"edge": {"value": 42, "unit": "C"}}
    }]"#;

    fn make_collector(source: impl SmiSource + 'static) -> MetricCollector {
        MetricCollector::new(
            Arc::new(source),
            &WebConfig::default(),
            &FilterConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_scrape_single_gpu() {
        let collector = make_collector(StaticSource::new(SINGLE_GPU));

        let output = collector.scrape().await;

        let expected = "\
# HELP amd_gpu_usage_percent GPU usage metrics in percent
# TYPE amd_gpu_usage_percent gauge
amd_gpu_usage_percent{gpu=\"0\",type=\"gfx\"} 0
amd_gpu_usage_percent{gpu=\"0\",type=\"umc\"} 2
# HELP amd_gpu_power_watts GPU power consumption in watts
# TYPE amd_gpu_power_watts gauge
amd_gpu_power_watts{gpu=\"0\",type=\"socket\"} 41
# HELP amd_gpu_temperature_celsius GPU temperature in celsius
# TYPE amd_gpu_temperature_celsius gauge
amd_gpu_temperature_celsius{gpu=\"0\",type=\"edge\"} 42
";
        assert_eq!(output, expected);
        assert_eq!(collector.series_count(), 4);
    }

    #[tokio::test]
    async fn test_memory_rendered_in_bytes() {
        let doc = r#"[{"gpu": 0, "mem_usage": {"total_vram": {"value": 46064, "unit": "MB"}}}]"#;
        let collector = make_collector(StaticSource::new(doc));

        let output = collector.scrape().await;

        assert!(
            output.contains("amd_gpu_memory_bytes{gpu=\"0\",type=\"total_vram\"} 48301604864")
        );
    }

    #[tokio::test]
    async fn test_non_array_document_is_empty() {
        let collector = make_collector(StaticSource::new("{}"));

        let result = collector.collect().await;

        assert!(matches!(result, Err(CycleError::Shape { .. })));
        assert_eq!(collector.series_count(), 0);
        assert_eq!(collector.render(), "");
    }

    #[tokio::test]
    async fn test_invalid_json_is_empty() {
        let collector = make_collector(StaticSource::new("amd-smi: command not found"));

        let result = collector.collect().await;

        assert!(matches!(result, Err(CycleError::Decode(_))));
        assert_eq!(collector.render(), "");
    }

    #[tokio::test]
    async fn test_source_failure_is_empty() {
        let collector = make_collector(StaticSource::failing("device busy"));

        let output = collector.scrape().await;

        assert_eq!(output, "");
        let stats = collector.stats();
        assert_eq!(stats.scrapes, 1);
        assert_eq!(stats.scrape_failures, 1);
        assert!(!stats.last_scrape_success);
    }

    /// Serves documents from a list in turn, failing once the list is exhausted.
    struct SequenceSource {
        documents: Vec<&'static str>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl SmiSource for SequenceSource {
        async fn fetch(&self) -> Result<Vec<u8>, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.documents.get(call) {
                Some(doc) => Ok(doc.as_bytes().to_vec()),
                None => Err(SourceError::Spawn {
                    command: self.describe(),
                    source: std::io::Error::other("exhausted"),
                }),
            }
        }

        fn describe(&self) -> String {
            "sequence".to_string()
        }
    }

    #[tokio::test]
    async fn test_previous_cycle_is_discarded() {
        let collector = make_collector(SequenceSource {
            documents: vec![
                SINGLE_GPU,
                r#"[{"gpu": 1, "fan": {"rpm": 977}}]"#,
            ],
            calls: AtomicU64::new(0),
        });

        collector.collect().await.unwrap();
        assert_eq!(collector.series_count(), 4);

        collector.collect().await.unwrap();
        let families = collector.families();
        assert_eq!(families.len(), 1);
        assert_eq!(families.get(Family::Fan, "1", "rpm"), Some(977.0));
        assert_eq!(families.get(Family::Power, "0", "socket"), None);

        // Third call fails: nothing from earlier cycles survives.
        assert!(collector.collect().await.is_err());
        assert_eq!(collector.series_count(), 0);
        assert_eq!(collector.stats().successful_scrapes(), 2);
    }

    #[tokio::test]
    async fn test_scrape_is_idempotent() {
        let collector = make_collector(StaticSource::new(SINGLE_GPU));

        let first = collector.scrape().await;
        let second = collector.scrape().await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_family_filter_applied() {
        let collector = MetricCollector::new(
            Arc::new(StaticSource::new(SINGLE_GPU)),
            &WebConfig::default(),
            &FilterConfig {
                exclude_families: vec!["usage".to_string()],
                ..Default::default()
            },
        );

        let output = collector.scrape().await;

        assert!(!output.contains("amd_gpu_usage_percent"));
        assert!(output.contains("amd_gpu_power_watts"));
        assert_eq!(collector.series_count(), 2);
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let collector = MetricCollector::new(
            Arc::new(StaticSource::new(SINGLE_GPU)),
            &WebConfig {
                prefix: "rocm".to_string(),
                ..Default::default()
            },
            &FilterConfig::default(),
        );

        let output = collector.scrape().await;

        assert!(output.contains("# TYPE rocm_power_watts gauge"));
        assert!(collector.render_runtime().contains("rocm_exporter_scrapes_total 1"));
    }

    /// Returns a document whose readings all carry the call number.
    struct CountingSource {
        calls: AtomicU64,
    }

    #[async_trait]
    impl SmiSource for CountingSource {
        async fn fetch(&self) -> Result<Vec<u8>, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            let doc = format!(
                r#"[{{"gpu": 0, "temperature": {{"edge": {{"value": {n}}}, "hotspot": {{"value": {n}}}}}}}]"#
            );
            Ok(doc.into_bytes())
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scrapes_are_serialized() {
        let collector = Arc::new(make_collector(CountingSource {
            calls: AtomicU64::new(0),
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = collector.clone();
                tokio::spawn(async move { collector.scrape().await })
            })
            .collect();

        let mut seen = Vec::new();
        for handle in handles {
            let output = handle.await.unwrap();
            let values: Vec<&str> = output
                .lines()
                .filter(|line| !line.starts_with('#'))
                .filter_map(|line| line.rsplit(' ').next())
                .collect();

            // Each response is one complete cycle: both readings, same cycle.
            assert_eq!(values.len(), 2, "output: {}", output);
            assert_eq!(values[0], values[1], "output: {}", output);
            seen.push(values[0].to_string());
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 8);
        assert_eq!(collector.stats().scrapes, 8);
    }

    #[tokio::test]
    async fn test_render_runtime() {
        let collector = make_collector(StaticSource::new(SINGLE_GPU));
        collector.scrape().await;

        let output = collector.render_runtime();

        assert!(output.contains("# TYPE amd_gpu_exporter_scrapes_total counter"));
        assert!(output.contains("amd_gpu_exporter_scrapes_total 1\n"));
        assert!(output.contains("amd_gpu_exporter_scrape_failures_total 0\n"));
        assert!(output.contains("amd_gpu_exporter_last_scrape_success 1\n"));
        assert!(output.contains("amd_gpu_exporter_devices 1\n"));
        assert!(output.contains("amd_gpu_exporter_series 4\n"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_render_runtime_includes_process_metrics() {
        let collector = make_collector(StaticSource::new(SINGLE_GPU));

        let output = collector.render_runtime();

        assert!(output.contains("# TYPE process_resident_memory_bytes gauge"));
        assert!(output.contains("process_start_time_seconds "));
        // Scrape counters still come first
        assert!(output.starts_with("# HELP amd_gpu_exporter_scrapes_total"));
    }

    fn panicking_mapper(_: &Value) -> Result<MetricFamilies, CycleError> {
        panic!("unexpected document layout");
    }

    #[tokio::test]
    async fn test_mapping_panic_is_contained() {
        let collector =
            make_collector(StaticSource::new(SINGLE_GPU)).with_mapper(panicking_mapper);

        let result = collector.collect().await;
        assert!(matches!(result, Err(CycleError::Panicked(_))));

        let output = collector.scrape().await;
        assert_eq!(output, "");

        let stats = collector.stats();
        assert_eq!(stats.scrapes, 2);
        assert_eq!(stats.scrape_failures, 2);
        assert!(!stats.last_scrape_success);
    }

    /// Never produces a document.
    struct HangingSource;

    #[async_trait]
    impl SmiSource for HangingSource {
        async fn fetch(&self) -> Result<Vec<u8>, SourceError> {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "hanging".to_string()
        }
    }

    #[tokio::test]
    async fn test_cancelled_cycle_counts_as_failure() {
        let collector = make_collector(HangingSource);

        let cancelled = tokio::time::timeout(Duration::from_millis(20), collector.scrape()).await;
        assert!(cancelled.is_err());

        let stats = collector.stats();
        assert_eq!(stats.scrapes, 1);
        assert_eq!(stats.scrape_failures, 1);
        assert!(!stats.last_scrape_success);
        assert_eq!(stats.successful_scrapes(), 0);
        assert_eq!(collector.render(), "");
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("simple"), "simple");
        assert_eq!(escape_label_value("with\"quote"), "with\\\"quote");
        assert_eq!(escape_label_value("with\\backslash"), "with\\\\backslash");
        assert_eq!(escape_label_value("with\nnewline"), "with\\nnewline");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(42.0), "42");
        assert_eq!(format_value(48_301_604_864.0), "48301604864");
        assert_eq!(format_value(3.14), "3.14");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
    }
}
