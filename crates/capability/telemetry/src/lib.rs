//! 日志初始化、传输指标与 trace id 生成。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 传输指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub transactions: u64,
    pub transaction_failures: u64,
    pub connects: u64,
    pub connect_failures: u64,
    pub gate_rejections: u64,
    pub gate_timeouts: u64,
    pub realignments: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub transaction_latency_ms_total: u64,
    pub transaction_latency_ms_count: u64,
}

/// 传输指标（进程级计数器）。
pub struct TransportMetrics {
    transactions: AtomicU64,
    transaction_failures: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
    gate_rejections: AtomicU64,
    gate_timeouts: AtomicU64,
    realignments: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    transaction_latency_ms_total: AtomicU64,
    transaction_latency_ms_count: AtomicU64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self {
            transactions: AtomicU64::new(0),
            transaction_failures: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            gate_rejections: AtomicU64::new(0),
            gate_timeouts: AtomicU64::new(0),
            realignments: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            transaction_latency_ms_total: AtomicU64::new(0),
            transaction_latency_ms_count: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions: self.transactions.load(Ordering::Relaxed),
            transaction_failures: self.transaction_failures.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            gate_rejections: self.gate_rejections.load(Ordering::Relaxed),
            gate_timeouts: self.gate_timeouts.load(Ordering::Relaxed),
            realignments: self.realignments.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            transaction_latency_ms_total: self
                .transaction_latency_ms_total
                .load(Ordering::Relaxed),
            transaction_latency_ms_count: self
                .transaction_latency_ms_count
                .load(Ordering::Relaxed),
        }
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TransportMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TransportMetrics {
    METRICS.get_or_init(TransportMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的事务 trace_id。
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 记录事务结果与耗时（毫秒）。
pub fn record_transaction(success: bool, latency_ms: u64) {
    let metrics = metrics();
    metrics.transactions.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.transaction_failures.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .transaction_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .transaction_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录建立连接成功次数。
pub fn record_connect() {
    metrics().connects.fetch_add(1, Ordering::Relaxed);
}

/// 记录建立连接失败次数。
pub fn record_connect_failure() {
    metrics().connect_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录准入控制拒绝次数。
pub fn record_gate_rejection() {
    metrics().gate_rejections.fetch_add(1, Ordering::Relaxed);
}

/// 记录等待闸门超时次数。
pub fn record_gate_timeout() {
    metrics().gate_timeouts.fetch_add(1, Ordering::Relaxed);
}

/// 记录帧头重新对齐次数。
pub fn record_realignment() {
    metrics().realignments.fetch_add(1, Ordering::Relaxed);
}

/// 记录发送字节数。
pub fn record_bytes_sent(bytes: usize) {
    metrics()
        .bytes_sent
        .fetch_add(bytes as u64, Ordering::Relaxed);
}

/// 记录接收字节数。
pub fn record_bytes_received(bytes: usize) {
    metrics()
        .bytes_received
        .fetch_add(bytes as u64, Ordering::Relaxed);
}
