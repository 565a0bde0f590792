//! Prometheus metrics for the RLHF daemon
//!
//! Pipeline metrics are fed from the service's event stream by
//! [`record_events`]; HTTP metrics are recorded by the router middleware.

use std::sync::LazyLock;

use prometheus::{
    Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tracing::debug;

use rlhf_train::{RlhfEvent, TrainingOutcome, TrainingResult};

/// Global Prometheus registry for RLHF metrics
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let registry = Registry::new();

    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(HTTP_REQUEST_DURATION.clone()),
        Box::new(FEEDBACK_TOTAL.clone()),
        Box::new(FEEDBACK_REWARD.clone()),
        Box::new(FEEDBACK_EXPIRED_TOTAL.clone()),
        Box::new(TRAINING_ROUNDS_TOTAL.clone()),
        Box::new(TRAINING_LOSS.clone()),
        Box::new(TRAINING_GRADIENT_NORM.clone()),
        Box::new(TRAINING_SAMPLES_TOTAL.clone()),
        Box::new(CHECKPOINTS_SAVED_TOTAL.clone()),
        Box::new(BUFFER_SIZE.clone()),
        Box::new(FEEDBACK_STORE_SIZE.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            tracing::error!("Failed to register metric: {}", e);
        }
    }

    registry
});

// =============================================================================
// HTTP Metrics
// =============================================================================

/// Total HTTP requests by endpoint and status
pub static HTTP_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("requests_total", "Total number of HTTP requests")
            .namespace("rlhf")
            .subsystem("http"),
        &["endpoint", "method", "status"],
    )
    .expect("valid metric definition")
});

/// HTTP request duration histogram
pub static HTTP_REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new("request_duration_seconds", "HTTP request duration in seconds")
            .namespace("rlhf")
            .subsystem("http")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["endpoint", "method"],
    )
    .expect("valid metric definition")
});

// =============================================================================
// Feedback Metrics
// =============================================================================

/// Accepted feedback by whether it replaced an earlier submission
pub static FEEDBACK_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("submitted_total", "Total feedback accepted")
            .namespace("rlhf")
            .subsystem("feedback"),
        &["kind"],
    )
    .expect("valid metric definition")
});

/// Distribution of computed rewards
pub static FEEDBACK_REWARD: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("reward", "Reward computed from feedback")
            .namespace("rlhf")
            .subsystem("feedback")
            .buckets(vec![-10.0, -5.0, -1.0, 0.0, 1.0, 5.0, 10.0, 15.0, 20.0, 30.0]),
    )
    .expect("valid metric definition")
});

/// Records removed by staleness sweeps
pub static FEEDBACK_EXPIRED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("rlhf_feedback_expired_total", "Feedback records expired by staleness sweeps")
        .expect("valid metric definition")
});

/// Records currently held by the feedback store
pub static FEEDBACK_STORE_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("rlhf_feedback_store_size", "Feedback records currently retained")
        .expect("valid metric definition")
});

// =============================================================================
// Training Metrics
// =============================================================================

/// Training rounds by outcome
pub static TRAINING_ROUNDS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("rounds_total", "Training rounds by outcome")
            .namespace("rlhf")
            .subsystem("training"),
        &["outcome", "strategy"],
    )
    .expect("valid metric definition")
});

/// Mean loss of the last completed update
pub static TRAINING_LOSS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("rlhf_training_loss", "Mean loss of the last completed update")
        .expect("valid metric definition")
});

/// Pre-clip gradient norm of the last completed update
pub static TRAINING_GRADIENT_NORM: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("rlhf_training_gradient_norm", "Gradient norm before clipping of the last update")
        .expect("valid metric definition")
});

/// Experiences consumed by completed updates
pub static TRAINING_SAMPLES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("rlhf_training_samples_total", "Experiences consumed by completed updates")
        .expect("valid metric definition")
});

/// Checkpoints written
pub static CHECKPOINTS_SAVED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("rlhf_checkpoints_saved_total", "Checkpoints written")
        .expect("valid metric definition")
});

/// Experiences currently buffered
pub static BUFFER_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("rlhf_replay_buffer_size", "Experiences currently in the replay buffer")
        .expect("valid metric definition")
});

// =============================================================================
// Utility Functions
// =============================================================================

/// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

/// Record HTTP request metrics
pub fn record_http_request(endpoint: &str, method: &str, status: u16, duration_secs: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[endpoint, method, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[endpoint, method])
        .observe(duration_secs);
}

/// Record an accepted submission
pub fn record_feedback(reward: f64, replaced: bool) {
    let kind = if replaced { "replaced" } else { "new" };
    FEEDBACK_TOTAL.with_label_values(&[kind]).inc();
    FEEDBACK_REWARD.observe(reward);
}

/// Record the result of a training round
pub fn record_training(result: &TrainingResult) {
    let outcome = match &result.outcome {
        TrainingOutcome::Updated => "updated",
        TrainingOutcome::Skipped { .. } => "skipped",
        TrainingOutcome::Failed { .. } => "failed",
    };
    TRAINING_ROUNDS_TOTAL
        .with_label_values(&[outcome, result.strategy_used.as_str()])
        .inc();

    if result.is_updated() {
        TRAINING_LOSS.set(result.mean_loss);
        TRAINING_GRADIENT_NORM.set(result.gradient_norm);
        TRAINING_SAMPLES_TOTAL.inc_by(result.samples_used as u64);
    }
    if result.checkpoint.is_some() {
        CHECKPOINTS_SAVED_TOTAL.inc();
    }
}

/// Update the store and buffer gauges
pub fn set_pipeline_sizes(feedback: usize, buffered: usize) {
    FEEDBACK_STORE_SIZE.set(feedback as i64);
    BUFFER_SIZE.set(buffered as i64);
}

/// Translate service events into metrics until the service goes away
pub async fn record_events(mut events: broadcast::Receiver<RlhfEvent>) {
    loop {
        match events.recv().await {
            Ok(RlhfEvent::RewardComputed { reward, replaced, .. }) => record_feedback(reward, replaced),
            Ok(RlhfEvent::TrainingCompleted(result)) => record_training(&result),
            Ok(RlhfEvent::FeedbackExpired { removed }) => FEEDBACK_EXPIRED_TOTAL.inc_by(removed as u64),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "Metrics recorder lagged behind service events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rlhf_train::{SkipReason, TriggerSource, UpdateStrategy};

    fn result(outcome: TrainingOutcome) -> TrainingResult {
        TrainingResult {
            round_id: 1,
            strategy_used: UpdateStrategy::Ppo,
            mean_loss: 0.5,
            gradient_norm: 2.0,
            samples_used: 32,
            timestamp: Utc::now(),
            outcome,
            checkpoint: None,
            trigger: TriggerSource::Manual,
        }
    }

    #[test]
    fn test_metrics_encode() {
        record_feedback(18.5, false);
        record_training(&result(TrainingOutcome::Updated));
        record_training(&result(TrainingOutcome::Skipped {
            reason: SkipReason::CycleInProgress,
        }));
        set_pipeline_sizes(10, 4);

        let output = encode_metrics();
        assert!(output.contains("rlhf_feedback_submitted_total"));
        assert!(output.contains("rlhf_training_rounds_total"));
        assert!(output.contains("rlhf_replay_buffer_size"));
        assert!(output.contains("outcome=\"skipped\""));
    }

    #[test]
    fn test_http_request_metrics() {
        record_http_request("/health", "GET", 200, 0.015);

        let output = encode_metrics();
        assert!(output.contains("rlhf_http_requests_total"));
        assert!(output.contains("rlhf_http_request_duration_seconds"));
    }
}
