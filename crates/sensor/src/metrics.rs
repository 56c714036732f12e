use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Encoder, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref EVENTS_RECEIVED_TOTAL: IntCounter = IntCounter::new(
        "tripwire_events_received_total",
        "Total number of events received from the event bus."
    )
    .unwrap();
    pub static ref EVENTS_REJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "tripwire_events_rejected_total",
            "Events rejected by dependency filters."
        ),
        &["dependency"]
    )
    .unwrap();
    pub static ref FILTER_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "tripwire_filter_errors_total",
            "Events that could not be evaluated against dependency filters."
        ),
        &["dependency"]
    )
    .unwrap();
    pub static ref TRIGGERS_SUCCEEDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "tripwire_triggers_succeeded_total",
            "Triggers executed successfully."
        ),
        &["trigger"]
    )
    .unwrap();
    pub static ref TRIGGERS_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tripwire_triggers_failed_total", "Triggers that failed."),
        &["trigger"]
    )
    .unwrap();
    pub static ref PERSISTENCE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "tripwire_persistence_failures_total",
        "Sensor status updates that failed after all retries."
    )
    .unwrap();
}

/// Register all collectors with the process registry. Safe to call more than once.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EVENTS_RECEIVED_TOTAL.clone()),
        Box::new(EVENTS_REJECTED_TOTAL.clone()),
        Box::new(FILTER_ERRORS_TOTAL.clone()),
        Box::new(TRIGGERS_SUCCEEDED_TOTAL.clone()),
        Box::new(TRIGGERS_FAILED_TOTAL.clone()),
        Box::new(PERSISTENCE_FAILURES_TOTAL.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::debug!("metric already registered: {}", e);
        }
    }
}

/// Text exposition of every registered metric.
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_registered_counters() {
        register_metrics();
        register_metrics();
        EVENTS_RECEIVED_TOTAL.inc();
        TRIGGERS_FAILED_TOTAL.with_label_values(&["t1"]).inc();

        let text = gather_metrics();
        assert!(text.contains("tripwire_events_received_total"));
        assert!(text.contains("tripwire_triggers_failed_total{trigger=\"t1\"}"));
    }
}
