//! Prometheus metrics for the CDC pipeline

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

lazy_static::lazy_static! {
    /// Change records committed to the target, by outcome (inserted/updated/deleted)
    pub static ref CDC_MESSAGES_APPLIED: IntCounterVec = register_int_counter_vec!(
        "cdc_messages_applied_total",
        "Change records applied to the target table",
        &["partition", "outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Change records committed without a row change, by reason
    pub static ref CDC_MESSAGES_SKIPPED: IntCounterVec = register_int_counter_vec!(
        "cdc_messages_skipped_total",
        "Change records skipped (stale, duplicate, missing entity, broker tombstone)",
        &["partition", "reason"]
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref CDC_DEAD_LETTERS: IntCounterVec = register_int_counter_vec!(
        "cdc_dead_letters_total",
        "Change records routed to the dead-letter table",
        &["partition", "error_class"]
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref CDC_DEAD_LETTER_MIRROR_FAILURES: IntCounter = register_int_counter!(
        "cdc_dead_letter_mirror_failures_total",
        "Dead letters committed to the table but not mirrored to the DLQ topic"
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref CDC_RETRIES: IntCounterVec = register_int_counter_vec!(
        "cdc_retries_total",
        "Retried units of work by error class",
        &["partition", "error_class"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// 1 while the partition worker is applying normally
    pub static ref CDC_WORKER_HEALTHY: IntGaugeVec = register_int_gauge_vec!(
        "cdc_worker_healthy",
        "Partition worker health (1 = healthy, 0 = retrying or failed)",
        &["partition"]
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref CDC_CHECKPOINT_POSITION: IntGaugeVec = register_int_gauge_vec!(
        "cdc_checkpoint_position",
        "Last committed broker offset per partition",
        &["partition"]
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref CDC_CONSUMER_ERRORS: IntCounter = register_int_counter!(
        "cdc_consumer_errors_total",
        "Kafka consumer errors on the main queue"
    ).expect("Prometheus metrics registration should succeed at startup");

    pub static ref CDC_CONSUMER_HEALTHY: IntGauge = register_int_gauge!(
        "cdc_consumer_healthy",
        "CDC consumer health status (1 = healthy, 0 = unhealthy)"
    ).expect("Prometheus metrics registration should succeed at startup");
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_pipeline_metrics() {
        CDC_MESSAGES_APPLIED
            .with_label_values(&["77", "inserted"])
            .inc();
        let text = render().unwrap();
        assert!(text.contains("cdc_messages_applied_total"));
    }
}
