//! Prometheus metrics for issuance and validation.
//!
//! Each [`ServiceMetrics`] owns its registry so several app instances (as in
//! tests) never collide on registration. `/metrics` renders it in the text
//! exposition format.

use prometheus::{
    histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder,
};

pub struct ServiceMetrics {
    registry: Registry,
    issued_total: IntCounterVec,
    issue_failures_total: IntCounterVec,
    validations_total: IntCounterVec,
    validation_duration_seconds: HistogramVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let issued_total = IntCounterVec::new(
            opts!("devicelock_tokens_issued_total", "Tokens issued"),
            &["source"],
        )?;
        let issue_failures_total = IntCounterVec::new(
            opts!("devicelock_issue_failures_total", "Failed issue requests by error code"),
            &["code"],
        )?;
        let validations_total = IntCounterVec::new(
            opts!("devicelock_validations_total", "Validation requests by outcome"),
            &["outcome"],
        )?;
        let validation_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "devicelock_validation_duration_seconds",
                "Validation latency in seconds, lock wait included",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(issued_total.clone()))?;
        registry.register(Box::new(issue_failures_total.clone()))?;
        registry.register(Box::new(validations_total.clone()))?;
        registry.register(Box::new(validation_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            issued_total,
            issue_failures_total,
            validations_total,
            validation_duration_seconds,
        })
    }

    pub fn record_issued(&self, custom: bool) {
        let source = if custom { "custom" } else { "generated" };
        self.issued_total.with_label_values(&[source]).inc();
    }

    pub fn record_issue_failure(&self, code: &str) {
        self.issue_failures_total.with_label_values(&[code]).inc();
    }

    pub fn record_validation(&self, outcome: &str, elapsed: std::time::Duration) {
        self.validations_total.with_label_values(&[outcome]).inc();
        self.validation_duration_seconds
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics output is not UTF-8: {}", e)))
    }
}
