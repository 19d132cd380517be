use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("generation_requests_total", "Total number of generation requests")
            .expect("register generation_requests_total");
    pub static ref INVALID_REQUESTS: Counter = register_counter!(
        "generation_invalid_requests_total",
        "Requests rejected by validation"
    )
    .expect("register generation_invalid_requests_total");
    pub static ref RATE_LIMITED: Counter = register_counter!(
        "generation_rate_limited_total",
        "Requests rejected by admission control"
    )
    .expect("register generation_rate_limited_total");
    pub static ref UPSTREAM_ERRORS: Counter = register_counter!(
        "generation_upstream_errors_total",
        "Failed upstream completions, streamed or not"
    )
    .expect("register generation_upstream_errors_total");
    pub static ref STREAM_CHUNKS: Counter = register_counter!(
        "generation_stream_chunks_total",
        "Stream frames written to clients"
    )
    .expect("register generation_stream_chunks_total");
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "generation_request_latency_seconds",
        "Non-streaming request latency in seconds"
    )
    .expect("register generation_request_latency_seconds");
    pub static ref RATE_LIMIT_KEYS: Gauge = register_gauge!(
        "generation_rate_limit_keys",
        "Client keys currently tracked by the rate limiter"
    )
    .expect("register generation_rate_limit_keys");
}

// Text exposition of every registered collector
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
