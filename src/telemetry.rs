use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to build Prometheus exporter: {0}")]
    Exporter(String),
}

pub struct Metrics {
    worker_invocations: Counter<u64>,
    worker_duration: Histogram<u64>,
    record_write_failures: Counter<u64>,
    pub registry: Registry,
    // Owns the exporter pipeline; the global provider may be replaced later.
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("feature_lab");
        global::set_meter_provider(provider.clone());

        let worker_invocations = meter
            .u64_counter("worker_invocations_total")
            .with_description("Worker invocations by operation and outcome")
            .build();

        // Workers range from sub-second analysis runs to minutes of training.
        let boundaries = generate_boundaries((100, 1_000, 10_000, 60_000, 600_000));

        let worker_duration = meter
            .u64_histogram("worker_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Wall time of worker invocations in milliseconds")
            .build();

        let record_write_failures = meter
            .u64_counter("record_write_failures_total")
            .with_description("Analysis records that could not be persisted")
            .build();

        Ok(Metrics {
            worker_invocations,
            worker_duration,
            record_write_failures,
            registry,
            _provider: provider,
        })
    }

    pub fn record_invocation(&self, operation: &str, outcome: &str, duration_ms: u64) {
        let attributes = [
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.worker_invocations.add(1, &attributes);
        self.worker_duration
            .record(duration_ms, &[KeyValue::new("operation", operation.to_string())]);
    }

    pub fn record_write_failure(&self, operation: &str) {
        let attributes = [KeyValue::new("operation", operation.to_string())];
        self.record_write_failures.add(1, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let steps = [
        (parts.0, parts.1, ((parts.1 - parts.0) / 9).max(1)),
        (parts.1, parts.2, ((parts.2 - parts.1) / 9).max(1)),
        (parts.2, parts.3, ((parts.3 - parts.2) / 5).max(1)),
        (parts.3, parts.4, ((parts.4 - parts.3) / 9).max(1)),
    ];

    let mut seen = HashSet::new();
    steps
        .into_iter()
        .flat_map(|(start, end, step)| (start..=end).step_by(step as usize))
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (10, 100, 1_000, 6_000, 60_000);
        let get = generate_boundaries(parts);

        assert_eq!(get.first(), Some(&10.0));
        assert_eq!(get.last(), Some(&60_000.0));
        assert!(get.windows(2).all(|w| w[0] < w[1]));
        assert!(get.contains(&100.0));
        assert!(get.contains(&1_000.0));
        assert!(get.contains(&6_000.0));
    }
}
