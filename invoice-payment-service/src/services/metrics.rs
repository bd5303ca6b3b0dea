use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PAYMENT_METRICS: OnceLock<PaymentMetrics> = OnceLock::new();

struct PaymentMetrics {
    registry: Registry,
    initiations: IntCounterVec,
    callbacks: IntCounterVec,
    amount_settled: IntCounterVec,
}

impl PaymentMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let initiations = IntCounterVec::new(
            Opts::new(
                "payment_initiations_total",
                "STK push initiation attempts by organization and outcome",
            ),
            &["organization_id", "outcome"],
        )?;
        let callbacks = IntCounterVec::new(
            Opts::new(
                "payment_callbacks_total",
                "STK callback deliveries by reconciliation outcome",
            ),
            &["outcome"],
        )?;
        let amount_settled = IntCounterVec::new(
            Opts::new(
                "payment_amount_settled_total",
                "Settled invoice amounts by organization (whole units)",
            ),
            &["organization_id"],
        )?;

        registry.register(Box::new(initiations.clone()))?;
        registry.register(Box::new(callbacks.clone()))?;
        registry.register(Box::new(amount_settled.clone()))?;

        Ok(Self {
            registry,
            initiations,
            callbacks,
            amount_settled,
        })
    }
}

/// Install the Prometheus recorder and the payment counters.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_none() {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(e) => tracing::warn!(error = %e, "Prometheus recorder not installed"),
        }
    }
    payment_metrics();
}

fn payment_metrics() -> Option<&'static PaymentMetrics> {
    if let Some(metrics) = PAYMENT_METRICS.get() {
        return Some(metrics);
    }
    match PaymentMetrics::new() {
        Ok(metrics) => Some(PAYMENT_METRICS.get_or_init(|| metrics)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to register payment metrics");
            None
        }
    }
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(metrics) = PAYMENT_METRICS.get() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metrics.registry.gather(), &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_initiation(organization_id: i64, outcome: &str) {
    if let Some(metrics) = payment_metrics() {
        let organization = organization_id.to_string();
        metrics
            .initiations
            .with_label_values(&[organization.as_str(), outcome])
            .inc();
    }
}

pub fn record_callback(outcome: &str) {
    if let Some(metrics) = payment_metrics() {
        metrics.callbacks.with_label_values(&[outcome]).inc();
    }
}

pub fn record_settled_amount(organization_id: i64, whole_units: u64) {
    if let Some(metrics) = payment_metrics() {
        let organization = organization_id.to_string();
        metrics
            .amount_settled
            .with_label_values(&[organization.as_str()])
            .inc_by(whole_units);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_exposition() {
        record_callback("paid");
        record_initiation(7, "accepted");
        record_settled_amount(7, 15000);

        let output = get_metrics();
        assert!(output.contains("payment_callbacks_total"));
        assert!(output.contains("payment_initiations_total"));
        assert!(output.contains("payment_amount_settled_total"));
    }
}
