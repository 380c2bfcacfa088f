use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref VALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_valid_messages_total",
        "Total messages decoded and validated"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_messages_total",
        "Total malformed or out-of-range messages dropped"
    ))
    .unwrap();
    pub static ref UNROUTED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_unrouted_messages_total",
        "Messages dropped because the topic shape is not recognised"
    ))
    .unwrap();
    pub static ref GATED_MESSAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "ingestor_gated_messages_total",
            "Messages from coordinators that are not registered"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total repository failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to write a sample batch"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_batch_size",
        "Current sample batch size being processed"
    ))
    .unwrap();
    pub static ref SAMPLES_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_samples_dropped_total",
        "Samples dropped because the sample channel was full"
    ))
    .unwrap();
    pub static ref CHANGE_EVENTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_change_events_total",
        "Twin change events published"
    ))
    .unwrap();
    pub static ref CHANGE_EVENTS_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_change_events_dropped_total",
        "Twin change events overwritten before the mirror consumer read them"
    ))
    .unwrap();
    pub static ref COMMANDS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_commands_total",
        "Commands published to devices"
    ))
    .unwrap();
    pub static ref COMMAND_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_command_failures_total",
        "Commands that failed to publish"
    ))
    .unwrap();
    pub static ref ALERTS_CREATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ingestor_alerts_created_total", "Alerts raised"),
        &["category"]
    )
    .unwrap();
    pub static ref ALERTS_RESOLVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ingestor_alerts_resolved_total", "Alerts auto-resolved"),
        &["category"]
    )
    .unwrap();
    pub static ref STALE_TWINS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_stale_twins_total",
        "Twins flagged stale by the sweep"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(VALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(UNROUTED_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(GATED_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY.register(Box::new(BATCH_SIZE.clone())).unwrap();
    REGISTRY
        .register(Box::new(SAMPLES_DROPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANGE_EVENTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANGE_EVENTS_DROPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(COMMANDS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(COMMAND_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALERTS_CREATED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALERTS_RESOLVED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STALE_TWINS_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
