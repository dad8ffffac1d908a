use lazy_static::lazy_static;
use prometheus::{
    Gauge, IntCounter, IntGauge, register_gauge, register_int_counter, register_int_gauge,
};

lazy_static! {
    pub static ref LINES_INGESTED_TOTAL: IntCounter = register_int_counter!(
        "relay_lines_ingested_total",
        "Total raw lines read from all inputs"
    )
    .expect("metric registration");
    pub static ref PARSE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "relay_parse_failures_total",
        "Events emitted as raw fallbacks after a parse failure"
    )
    .expect("metric registration");
    pub static ref EVENTS_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "relay_events_dropped_total",
        "Events dropped by backpressure or a full job queue"
    )
    .expect("metric registration");
    pub static ref EVENTS_PROCESSED_THIS_SECOND: IntGauge = register_int_gauge!(
        "relay_events_processed_this_second",
        "Events handed to the worker pool in the current second"
    )
    .expect("metric registration");
    pub static ref THROUGHPUT_EVENTS_PER_SEC: IntGauge = register_int_gauge!(
        "relay_throughput_events_per_sec",
        "Events per second over the last refresh window"
    )
    .expect("metric registration");
    pub static ref BUFFER_EVENTS: IntGauge = register_int_gauge!(
        "relay_buffer_events",
        "Events currently queued in the event buffer"
    )
    .expect("metric registration");
    pub static ref P99_JOB_LATENCY_MS: Gauge = register_gauge!(
        "relay_p99_job_latency_ms",
        "99th percentile job latency in milliseconds"
    )
    .expect("metric registration");
    pub static ref STARTUP_DURATION_SECONDS: Gauge = register_gauge!(
        "relay_startup_duration_seconds",
        "Cold start duration in seconds"
    )
    .expect("metric registration");
    pub static ref MEMORY_BYTES: Gauge = register_gauge!(
        "relay_memory_bytes",
        "Resident memory used by the host, in bytes"
    )
    .expect("metric registration");
    pub static ref CPU_PERCENT: Gauge = register_gauge!(
        "relay_cpu_percent",
        "Average CPU load across all cores"
    )
    .expect("metric registration");
}
