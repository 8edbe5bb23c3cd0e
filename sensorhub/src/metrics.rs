use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "sensorhub_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref READINGS_STORED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "sensorhub_readings_stored_total",
        "Total readings written to storage"
    ))
    .unwrap();
    pub static ref MESSAGES_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "sensorhub_messages_dropped_total",
            "Total messages dropped, by reason"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref WRITE_RETRIES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "sensorhub_write_retries_total",
        "Total storage write retries after transient failures"
    ))
    .unwrap();
    pub static ref INGEST_FAILURES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "sensorhub_ingest_failures_total",
        "Total readings dropped because storage writes kept failing"
    ))
    .unwrap();
    pub static ref WRITE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "sensorhub_write_latency_seconds",
            "Time taken to store one reading, including retries"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref INFLIGHT_WRITES: IntGauge = IntGauge::with_opts(Opts::new(
        "sensorhub_inflight_writes",
        "Messages currently being processed"
    ))
    .unwrap();
    pub static ref BROKER_CONNECTED: IntGauge = IntGauge::with_opts(Opts::new(
        "sensorhub_broker_connected",
        "1 while subscribed to the MQTT broker"
    ))
    .unwrap();
    pub static ref READINGS_EXPIRED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "sensorhub_readings_expired_total",
        "Total readings removed by the retention sweep"
    ))
    .unwrap();
    pub static ref READINGS_ARCHIVED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "sensorhub_readings_archived_total",
        "Total readings moved to the archive collection"
    ))
    .unwrap();
    pub static ref QUERY_LATENCY_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "sensorhub_query_latency_seconds",
            "Time taken to serve read API requests"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["operation"]
    )
    .unwrap();
}

/// Drop reasons used as label values.
pub mod reason {
    pub const INVALID_TOPIC: &str = "invalid_topic";
    pub const PARSE: &str = "parse";
    pub const VALIDATION: &str = "validation";
    pub const STORAGE: &str = "storage";
}

pub fn record_drop(reason: &str) {
    MESSAGES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_STORED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WRITE_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WRITE_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(INFLIGHT_WRITES.clone()))?;
    REGISTRY.register(Box::new(BROKER_CONNECTED.clone()))?;
    REGISTRY.register(Box::new(READINGS_EXPIRED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINGS_ARCHIVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUERY_LATENCY_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
