//! Cleanup sweep metrics for Prometheus.
//!
//! Collectors register with the default registry on first use. [`render`] returns the default
//! registry in the text exposition format for whatever scrapes the process.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, TextEncoder, register_histogram, register_int_counter, register_int_counter_vec,
};

use crate::types::RegistrantKind;

/// Registrants deleted by the sweep, by kind
static REGISTRANTS_RECLAIMED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "regctl_sweep_registrants_reclaimed_total",
        "Total orphaned registrants deleted by the cleanup sweep",
        &["kind"]
    )
    .expect("Failed to register regctl_sweep_registrants_reclaimed_total metric")
});

static OWNERS_REMOVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "regctl_sweep_owners_removed_total",
        "Total owner rows removed while reconciling addresses touched by the cleanup sweep"
    )
    .expect("Failed to register regctl_sweep_owners_removed_total metric")
});

/// Sweep cycles by outcome: completed, skipped or failed
static CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("regctl_sweep_cycles_total", "Total cleanup sweep cycles", &["outcome"])
        .expect("Failed to register regctl_sweep_cycles_total metric")
});

/// Buckets: 10ms, 50ms, 100ms, 500ms, 1s, 5s, 10s, 30s, 60s
static CYCLE_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "regctl_sweep_cycle_duration_seconds",
        "Wall time of completed cleanup sweep cycles (seconds)",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register regctl_sweep_cycle_duration_seconds metric")
});

pub fn record_registrants_reclaimed(kind: RegistrantKind, count: u64) {
    REGISTRANTS_RECLAIMED.with_label_values(&[kind.as_str()]).inc_by(count);
}

pub fn record_owners_removed(count: u64) {
    OWNERS_REMOVED.inc_by(count);
}

/// Record the outcome of one cycle, plus its duration when it ran to completion
pub fn record_cycle(outcome: &str, duration_seconds: Option<f64>) {
    CYCLES.with_label_values(&[outcome]).inc();
    if let Some(seconds) = duration_seconds {
        CYCLE_DURATION_SECONDS.observe(seconds);
    }
}

/// Encode the default registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_values_are_rendered() {
        record_registrants_reclaimed(RegistrantKind::LegalEntity, 2);
        record_owners_removed(1);
        record_cycle("completed", Some(0.2));
        record_cycle("skipped", None);

        let text = render().unwrap();
        assert!(text.contains("regctl_sweep_registrants_reclaimed_total{kind=\"legal_entity\"}"));
        assert!(text.contains("regctl_sweep_owners_removed_total"));
        assert!(text.contains("regctl_sweep_cycles_total{outcome=\"skipped\"}"));
        assert!(text.contains("regctl_sweep_cycle_duration_seconds_bucket"));
    }
}
