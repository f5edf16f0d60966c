//! Prometheus metrics for the pipeline.
//!
//! Registered once in the global default registry and scraped from
//! `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec,
    TextEncoder,
};

pub struct PipelineMetrics {
    intake_total: CounterVec,
    outcomes_total: CounterVec,
    retries_total: CounterVec,
    dead_letters_total: CounterVec,
    processing_duration_seconds: HistogramVec,
}

pub static METRICS: Lazy<PipelineMetrics> = Lazy::new(PipelineMetrics::register);

impl PipelineMetrics {
    fn register() -> Self {
        let intake_total = register_counter_vec!(
            opts!("pipeline_intake_total", "Intake calls by result"),
            &["result"]
        )
        .expect("failed to register pipeline_intake_total");

        let outcomes_total = register_counter_vec!(
            opts!("pipeline_outcomes_total", "Processed messages by tenant and outcome"),
            &["tenant_id", "outcome"]
        )
        .expect("failed to register pipeline_outcomes_total");

        let retries_total = register_counter_vec!(
            opts!("pipeline_retries_total", "Messages requeued on the retry topic"),
            &["tenant_id"]
        )
        .expect("failed to register pipeline_retries_total");

        let dead_letters_total = register_counter_vec!(
            opts!("pipeline_dead_letters_total", "Messages moved to dead-letter by reason"),
            &["tenant_id", "reason"]
        )
        .expect("failed to register pipeline_dead_letters_total");

        let processing_duration_seconds = register_histogram_vec!(
            prometheus::histogram_opts!(
                "pipeline_processing_duration_seconds",
                "Time spent processing one delivery",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["topic"]
        )
        .expect("failed to register pipeline_processing_duration_seconds");

        Self {
            intake_total,
            outcomes_total,
            retries_total,
            dead_letters_total,
            processing_duration_seconds,
        }
    }

    pub fn intake(&self, result: &str) {
        self.intake_total.with_label_values(&[result]).inc();
    }

    pub fn outcome(&self, tenant_id: &str, outcome: &str) {
        self.outcomes_total
            .with_label_values(&[tenant_id, outcome])
            .inc();
    }

    pub fn retry(&self, tenant_id: &str) {
        self.retries_total.with_label_values(&[tenant_id]).inc();
    }

    pub fn dead_letter(&self, tenant_id: &str, reason: &str) {
        self.dead_letters_total
            .with_label_values(&[tenant_id, reason])
            .inc();
    }

    pub fn observe_processing(&self, topic: &str, seconds: f64) {
        self.processing_duration_seconds
            .with_label_values(&[topic])
            .observe(seconds);
    }
}

/// Encode all registered metrics in Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
