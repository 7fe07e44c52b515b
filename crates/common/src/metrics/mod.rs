//! Metrics and observability utilities
//!
//! Pipeline counters and histograms with standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

/// Metrics prefix for all LedgerForge metrics
pub const METRICS_PREFIX: &str = "ledgerforge";

/// Buckets for stage latency (in seconds). OCR dominates the upper range.
pub const STAGE_BUCKETS: &[f64] = &[
    0.001, // 1ms
    0.005, // 5ms
    0.010, // 10ms
    0.050, // 50ms
    0.100, // 100ms
    0.500, // 500ms
    1.000, // 1s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
    60.00, // 1m
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_stage_runs_total", METRICS_PREFIX),
        Unit::Count,
        "Stage executions by stage and outcome"
    );

    describe_histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Stage execution latency in seconds"
    );

    describe_counter!(
        format!("{}_stage_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Stage attempts retried after a transient failure"
    );

    describe_counter!(
        format!("{}_gate_decisions_total", METRICS_PREFIX),
        Unit::Count,
        "Confidence gate decisions"
    );

    describe_histogram!(
        format!("{}_gate_overall_score", METRICS_PREFIX),
        Unit::Count,
        "Overall confidence score distribution"
    );

    describe_counter!(
        format!("{}_classifications_total", METRICS_PREFIX),
        Unit::Count,
        "Documents classified by type"
    );

    describe_counter!(
        format!("{}_promotions_total", METRICS_PREFIX),
        Unit::Count,
        "Promotion attempts by target and result"
    );

    describe_counter!(
        format!("{}_reconciled_items_total", METRICS_PREFIX),
        Unit::Count,
        "Stuck items requeued or failed by the reconciliation sweep"
    );

    tracing::info!("Metrics registered");
}

/// Record one stage execution
pub fn record_stage(stage: &str, outcome: &str, duration_secs: f64) {
    counter!(
        format!("{}_stage_runs_total", METRICS_PREFIX),
        "stage" => stage.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .record(duration_secs);
}

pub fn record_retry(stage: &str, attempt: u32) {
    counter!(
        format!("{}_stage_retries_total", METRICS_PREFIX),
        "stage" => stage.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

pub fn record_gate_decision(decision: &str, overall: f64) {
    counter!(
        format!("{}_gate_decisions_total", METRICS_PREFIX),
        "decision" => decision.to_string()
    )
    .increment(1);

    histogram!(format!("{}_gate_overall_score", METRICS_PREFIX)).record(overall);
}

pub fn record_classification(doc_type: &str) {
    counter!(
        format!("{}_classifications_total", METRICS_PREFIX),
        "doc_type" => doc_type.to_string()
    )
    .increment(1);
}

/// Record a promotion; `duplicate` marks hash collisions that resolved to an existing record
pub fn record_promotion(target: &str, duplicate: bool) {
    let result = if duplicate { "duplicate" } else { "created" };

    counter!(
        format!("{}_promotions_total", METRICS_PREFIX),
        "target" => target.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_reconciliation(action: &str, count: usize) {
    counter!(
        format!("{}_reconciled_items_total", METRICS_PREFIX),
        "action" => action.to_string()
    )
    .increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_buckets_sorted() {
        let mut prev = 0.0;
        for &bucket in STAGE_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: calls are no-ops
        register_metrics();
        record_stage("validate", "success", 0.002);
        record_retry("ocr", 2);
        record_gate_decision("AUTO_APPROVE", 0.93);
        record_promotion("invoices", false);
        record_reconciliation("requeued", 3);
    }
}
