use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref ROUTED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_routed_messages_total",
        "Total messages matched to a topic pattern"
    ))
    .unwrap();
    pub static ref DROPPED_MESSAGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "gateway_dropped_messages_total",
            "Total inbound messages dropped, by reason"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref TELEMETRY_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_telemetry_stored_total",
        "Total telemetry records persisted"
    ))
    .unwrap();
    pub static ref STORAGE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_storage_failures_total",
        "Total storage failures swallowed on the ingestion path"
    ))
    .unwrap();
    pub static ref COMMANDS_PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_commands_published_total",
        "Total control commands handed to the broker"
    ))
    .unwrap();
    pub static ref COMMANDS_UNPUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_commands_unpublished_total",
        "Total control commands not published because the broker was unavailable"
    ))
    .unwrap();
    pub static ref CONNECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_mqtt_connects_total",
        "Total transitions into the connected state"
    ))
    .unwrap();
    pub static ref CONNECTION_STATE: Gauge = Gauge::with_opts(Opts::new(
        "gateway_mqtt_connection_state",
        "0 disconnected, 1 connecting, 2 connected, 3 offline"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ROUTED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DROPPED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TELEMETRY_STORED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORAGE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_UNPUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONNECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONNECTION_STATE.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
