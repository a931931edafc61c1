use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref HTTP_REQUESTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_http_requests_total",
        "Total HTTP requests handled"
    ))
    .unwrap();
    pub static ref HTTP_ERRORS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_http_errors_total",
        "Total HTTP responses with a 4xx or 5xx status"
    ))
    .unwrap();
    pub static ref REQUEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "iotflow_request_latency_seconds",
            "HTTP request handling latency"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref MQTT_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_mqtt_messages_total",
        "Total messages received from the broker"
    ))
    .unwrap();
    pub static ref MQTT_INVALID_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_mqtt_invalid_total",
        "Total MQTT messages rejected before dispatch"
    ))
    .unwrap();
    pub static ref MQTT_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_mqtt_dropped_total",
        "Total MQTT messages dropped by the bounded queue"
    ))
    .unwrap();
    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::with_opts(Opts::new(
        "iotflow_mqtt_queue_depth",
        "Messages waiting between broker callback and pipeline"
    ))
    .unwrap();
    pub static ref TS_WRITE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "iotflow_ts_write_latency_seconds",
            "Time taken to flush a point batch into the time-series store"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref TS_WRITE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_ts_write_failures_total",
        "Time-series write attempts that failed"
    ))
    .unwrap();
    pub static ref POINTS_WRITTEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_points_written_total",
        "Telemetry points accepted by the time-series store"
    ))
    .unwrap();
    pub static ref AUTH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_auth_failures_total",
        "Authentication rejections across both ingresses"
    ))
    .unwrap();
    pub static ref RATE_LIMITED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_rate_limited_total",
        "Requests refused by a rate-limit bucket"
    ))
    .unwrap();
    pub static ref DEVICES_REGISTERED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_devices_registered_total",
        "Successful device registrations"
    ))
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "iotflow_batch_size",
        "Size of the point batch currently being flushed"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(HTTP_ERRORS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(REQUEST_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MQTT_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MQTT_INVALID_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MQTT_DROPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone())).unwrap();
    REGISTRY
        .register(Box::new(TS_WRITE_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(TS_WRITE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(POINTS_WRITTEN_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(AUTH_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RATE_LIMITED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DEVICES_REGISTERED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(BATCH_SIZE.clone())).unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
