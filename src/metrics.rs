use std::sync::LazyLock;

use prometheus::*;

static AUTO_DROPPED_CONFLICT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "al_auto_annotations_dropped_conflict",
        "auto annotations dropped because the image already had a manual one"
    )
    .unwrap()
});

static AUTO_DROPPED_THRESHOLD: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "al_auto_annotations_dropped_threshold",
        "detections discarded below the confidence threshold"
    )
    .unwrap()
});

static FETCH_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("al_fetch_failures", "image downloads skipped after an error").unwrap()
});

static EMBED_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("al_embed_failures", "images dropped from sampling as unreadable")
        .unwrap()
});

static STAGE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "al_stage_duration",
        "duration of one pipeline stage in seconds",
        &["stage"]
    )
    .unwrap()
});

pub fn inc_auto_dropped_conflict() {
    AUTO_DROPPED_CONFLICT.inc();
}

pub fn inc_auto_dropped_threshold() {
    AUTO_DROPPED_THRESHOLD.inc();
}

pub fn inc_fetch_failure() {
    FETCH_FAILURES.inc();
}

pub fn inc_embed_failure() {
    EMBED_FAILURES.inc();
}

pub fn observe_stage_duration(stage: &str, seconds: f64) {
    STAGE_DURATION.with_label_values(&[stage]).observe(seconds);
}
