use prometheus::{Gauge, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;

use crate::cli::VERSION;
use crate::error::MetricsError;

pub const NAMESPACE: &str = "speedtest";

pub const PING: &str = "speedtest_ping";
pub const DOWNLOAD: &str = "speedtest_download";
pub const UPLOAD: &str = "speedtest_upload";

/// Static description of a gauge before it is registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaugeSpec {
    pub namespace: String,
    pub name: String,
    pub help: String,
}

impl GaugeSpec {
    pub fn new(namespace: &str, name: &str, help: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            help: help.to_string(),
        }
    }

    /// `<namespace>_<name>`, the key the gauge is addressed by
    pub fn fq_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.namespace, self.name)
        }
    }
}

/// Point-in-time value of one gauge
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSample {
    pub name: String,
    pub value: f64,
}

/// Prometheus registry holding the speedtest gauges
///
/// Gauges are registered while the value is still exclusively owned; once
/// shared behind an `Arc` only `set`, `snapshot` and `gather` are reachable.
/// Each gauge stores its value in an atomic, so a scrape never waits on a writer.
#[derive(Debug, Clone)]
pub struct SpeedtestMetrics {
    gauges: BTreeMap<String, (GaugeSpec, Gauge)>,
    registry: Registry,
}

impl SpeedtestMetrics {
    /// Creates a registry with only the build info and process collectors
    pub fn empty() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let build_info = Gauge::with_opts(
            Opts::new(
                "speedtest_exporter_build_info",
                "A metric with a constant '1' value labeled by the version of the exporter.",
            )
            .const_label("version", VERSION),
        )?;
        build_info.set(1.0);
        registry.register(Box::new(build_info))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

        Ok(Self {
            gauges: BTreeMap::new(),
            registry,
        })
    }

    /// Creates the registry with the ping, download and upload gauges
    pub fn new() -> Result<Self, MetricsError> {
        let mut metrics = Self::empty()?;

        metrics.register(GaugeSpec::new(NAMESPACE, "ping", "Latency (ms)"))?;
        metrics.register(GaugeSpec::new(NAMESPACE, "download", "Download bandwidth (Mbps)."))?;
        metrics.register(GaugeSpec::new(NAMESPACE, "upload", "Upload bandwidth (Mbps)."))?;

        Ok(metrics)
    }

    /// Adds a gauge, failing when its fully qualified name is taken
    pub fn register(&mut self, spec: GaugeSpec) -> Result<(), MetricsError> {
        let fq_name = spec.fq_name();
        if self.gauges.contains_key(&fq_name) {
            return Err(MetricsError::AlreadyRegistered(fq_name));
        }

        let opts = Opts::new(spec.name.clone(), spec.help.clone()).namespace(spec.namespace.clone());
        let gauge = Gauge::with_opts(opts)?;
        self.registry.register(Box::new(gauge.clone()))?;
        self.gauges.insert(fq_name, (spec, gauge));

        Ok(())
    }

    /// Overwrites the current value of a registered gauge
    pub fn set(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        let (_, gauge) = self
            .gauges
            .get(name)
            .ok_or_else(|| MetricsError::UnknownGauge(name.to_string()))?;
        gauge.set(value);
        Ok(())
    }

    /// Current values of every registered gauge, ordered by name
    pub fn snapshot(&self) -> Vec<GaugeSample> {
        self.gauges
            .iter()
            .map(|(name, (_, gauge))| GaugeSample {
                name: name.clone(),
                value: gauge.get(),
            })
            .collect()
    }

    /// Gets metrics data in Prometheus text format
    pub fn gather(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        Ok(encoder.encode_to_string(&metric_families)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cold_start_exposes_zero_gauges() {
        let metrics = SpeedtestMetrics::new().unwrap();
        let text = metrics.gather().unwrap();

        assert!(text.contains("speedtest_ping 0\n"));
        assert!(text.contains("speedtest_download 0\n"));
        assert!(text.contains("speedtest_upload 0\n"));
        assert!(text.contains("# HELP speedtest_ping Latency (ms)\n"));
        assert!(text.contains("# TYPE speedtest_download gauge\n"));
        assert!(text.contains("speedtest_exporter_build_info{version=\""));
    }

    #[test]
    fn set_is_visible_in_snapshot_and_exposition() {
        let metrics = SpeedtestMetrics::new().unwrap();
        metrics.set(PING, 12.3).unwrap();
        metrics.set(DOWNLOAD, 45.6).unwrap();
        metrics.set(UPLOAD, 7.8).unwrap();

        let snapshot = metrics.snapshot();
        let values: Vec<(&str, f64)> = snapshot.iter().map(|s| (s.name.as_str(), s.value)).collect();
        assert_eq!(
            values,
            vec![(DOWNLOAD, 45.6), (PING, 12.3), (UPLOAD, 7.8)]
        );

        let text = metrics.gather().unwrap();
        assert!(text.contains("speedtest_ping 12.3\n"));
        assert!(text.contains("speedtest_download 45.6\n"));
        assert!(text.contains("speedtest_upload 7.8\n"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut metrics = SpeedtestMetrics::new().unwrap();
        let err = metrics
            .register(GaugeSpec::new(NAMESPACE, "ping", "again"))
            .unwrap_err();
        assert!(matches!(err, MetricsError::AlreadyRegistered(name) if name == PING));
    }

    #[test]
    fn unknown_gauge_is_an_error() {
        let metrics = SpeedtestMetrics::new().unwrap();
        let err = metrics.set("speedtest_jitter", 1.0).unwrap_err();
        assert!(matches!(err, MetricsError::UnknownGauge(_)));
        assert!(metrics.snapshot().iter().all(|s| s.value == 0.0));
    }

    fn speedtest_lines(text: &str) -> Vec<String> {
        text.lines()
            .filter(|l| l.starts_with("speedtest_"))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn gather_is_stable_without_writes() {
        let metrics = SpeedtestMetrics::new().unwrap();
        metrics.set(UPLOAD, 3.5).unwrap();
        let first = speedtest_lines(&metrics.gather().unwrap());
        assert_eq!(first.len(), 4);
        assert_eq!(first, speedtest_lines(&metrics.gather().unwrap()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_collector_is_exposed() {
        let text = SpeedtestMetrics::new().unwrap().gather().unwrap();
        assert!(text.contains("# TYPE process_cpu_seconds_total counter\n"));
        assert!(text.contains("process_resident_memory_bytes "));
        assert!(text.contains("process_open_fds "));
    }

    #[test]
    fn concurrent_readers_and_writer_do_not_corrupt_values() {
        let metrics = Arc::new(SpeedtestMetrics::new().unwrap());

        let writer = {
            let metrics = metrics.clone();
            std::thread::spawn(move || {
                for i in 0..1000 {
                    let v = i as f64;
                    metrics.set(PING, v).unwrap();
                    metrics.set(DOWNLOAD, v).unwrap();
                    metrics.set(UPLOAD, v).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        for sample in metrics.snapshot() {
                            assert!(sample.value >= 0.0 && sample.value < 1000.0);
                            assert_eq!(sample.value.fract(), 0.0);
                        }
                        assert!(metrics.gather().unwrap().contains("speedtest_ping "));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        assert!(metrics.snapshot().iter().all(|s| s.value == 999.0));
    }
}
