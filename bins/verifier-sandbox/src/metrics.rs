//! Prometheus metrics for the execution service.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Executions finished, labeled by outcome (`success`, `timeout`,
/// `infra_error`, `too_large`, `runner_error`).
const RUNS_TOTAL: &str = "sandbox_runs_total";
const RUN_DURATION: &str = "sandbox_run_duration_seconds";
const RUNS_IN_FLIGHT: &str = "sandbox_runs_in_flight";

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub runs_total: IntCounterVec,
    pub run_duration: Histogram,
    pub runs_in_flight: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let runs_total = IntCounterVec::new(
            Opts::new(RUNS_TOTAL, "Total executions by outcome"),
            &["status"],
        )?;
        let run_duration = Histogram::with_opts(
            HistogramOpts::new(RUN_DURATION, "Wall-clock time per execution in seconds")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let runs_in_flight = IntGauge::new(RUNS_IN_FLIGHT, "Executions currently running")?;

        registry.register(Box::new(runs_total.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(runs_in_flight.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            run_duration,
            runs_in_flight,
        })
    }

    pub fn record_outcome(&self, status: &str) {
        self.runs_total.with_label_values(&[status]).inc();
    }

    /// Text exposition format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Keeps `sandbox_runs_in_flight` accurate even when the handler future is dropped.
pub struct InFlight<'a>(&'a IntGauge);

impl<'a> InFlight<'a> {
    pub fn enter(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_all_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_outcome("success");
        metrics.run_duration.observe(0.2);
        let text = metrics.export().unwrap();
        assert!(text.contains("sandbox_runs_total{status=\"success\"} 1"));
        assert!(text.contains("sandbox_run_duration_seconds_count 1"));
        assert!(text.contains("sandbox_runs_in_flight 0"));
    }

    #[test]
    fn test_in_flight_guard() {
        let metrics = Metrics::new().unwrap();
        {
            let _a = InFlight::enter(&metrics.runs_in_flight);
            let _b = InFlight::enter(&metrics.runs_in_flight);
            assert_eq!(metrics.runs_in_flight.get(), 2);
        }
        assert_eq!(metrics.runs_in_flight.get(), 0);
    }

    #[test]
    fn test_registries_are_independent() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_outcome("timeout");
        assert!(!second.export().unwrap().contains("timeout"));
    }
}
