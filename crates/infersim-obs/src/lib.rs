//! Prometheus surface matching the serving stack being simulated.

use once_cell::sync::Lazy;
use prometheus::{Gauge, GaugeVec, IntCounter, IntGauge};
use tokio::sync::watch;

static KV_CACHE_USAGE: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!(
        "vllm:gpu_cache_usage_perc",
        "Fraction of KV-cache blocks currently in use (0..1)"
    )
    .unwrap()
});
static REQUESTS_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!(
        "vllm:num_requests_running",
        "Requests currently generating tokens"
    )
    .unwrap()
});
static REQUESTS_WAITING: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("vllm:num_requests_waiting", "Requests awaiting admission")
        .unwrap()
});
static LORA_INFO: Lazy<GaugeVec> = Lazy::new(|| {
    prometheus::register_gauge_vec!(
        "vllm:lora_requests_info",
        "Running LoRA adapters",
        &["running_lora_adapters", "max_lora"]
    )
    .unwrap()
});
static REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("infersim_requests_total", "Total completion requests")
        .unwrap()
});

/// Touch the statics so every metric is registered before first scrape.
pub fn init() {
    let _ = &*KV_CACHE_USAGE;
    let _ = &*REQUESTS_RUNNING;
    let _ = &*REQUESTS_WAITING;
    let _ = &*LORA_INFO;
    let _ = &*REQUESTS_TOTAL;
}

/// Mirrors the cache's usage watch channel into the usage gauge until the
/// cache side is dropped.
pub fn spawn_usage_polling(mut usage: watch::Receiver<f64>) {
    tokio::spawn(async move {
        KV_CACHE_USAGE.set(*usage.borrow_and_update());
        while usage.changed().await.is_ok() {
            KV_CACHE_USAGE.set(*usage.borrow_and_update());
        }
    });
}

pub fn inc_requests_total() {
    REQUESTS_TOTAL.inc();
}

pub fn add_running(delta: i64) {
    REQUESTS_RUNNING.add(delta);
}

pub fn add_waiting(delta: i64) {
    REQUESTS_WAITING.add(delta);
}

/// Replaces the advertised adapter set; the gauge value is the update time.
pub fn set_lora_adapters(adapters: &[String], max_loras: usize) {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    LORA_INFO.reset();
    LORA_INFO
        .with_label_values(&[&adapters.join(","), &max_loras.to_string()])
        .set(ts);
}
