//! Pool metrics: write latency and throughput, allocation rates, zone gauges.
//!
//! The counters are plain atomics so zones and the pool can report from any
//! thread. The `qps_*_now` pair is a sampling window owned by the idle
//! detector, which clears it before each measurement interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shared metric counters for one zone pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    write_ops: AtomicU64,
    read_ops: AtomicU64,
    bytes_written: AtomicU64,
    write_latency_us: AtomicU64,
    write_latency_samples: AtomicU64,
    io_allocs: AtomicU64,
    io_alloc_latency_us: AtomicU64,
    meta_allocs: AtomicU64,
    meta_alloc_latency_us: AtomicU64,
    open_zones: AtomicU64,
    active_zones: AtomicU64,
    qps_write_now: AtomicU64,
    qps_read_now: AtomicU64,
}

impl PoolMetrics {
    /// Creates a fresh, all-zero metrics block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed zone append. Bytes are accounted separately per
    /// device write via [`PoolMetrics::add_bytes_written`], so partial writes
    /// count even when the append later fails.
    pub fn record_zone_write(&self, latency: Duration) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.write_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.write_latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps the write-QPS sampling window. Reported at append entry so the
    /// idle detector sees attempts, not just completions.
    pub fn report_write_qps(&self) {
        self.qps_write_now.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one pool read and bumps the read-QPS sampling window.
    pub fn report_read_qps(&self) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.qps_read_now.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds raw bytes pushed to the device, including partial writes.
    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one I/O-zone allocation attempt.
    pub fn record_io_alloc(&self, latency: Duration) {
        self.io_allocs.fetch_add(1, Ordering::Relaxed);
        self.io_alloc_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Records one metadata-zone allocation attempt.
    pub fn record_meta_alloc(&self, latency: Duration) {
        self.meta_allocs.fetch_add(1, Ordering::Relaxed);
        self.meta_alloc_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Updates the open/active zone gauges.
    pub fn set_zone_gauges(&self, open: u64, active: u64) {
        self.open_zones.store(open, Ordering::Relaxed);
        self.active_zones.store(active, Ordering::Relaxed);
    }

    /// Clears the QPS sampling window.
    pub fn clear_qps_now(&self) {
        self.qps_write_now.store(0, Ordering::Relaxed);
        self.qps_read_now.store(0, Ordering::Relaxed);
    }

    /// Writes observed since the window was last cleared.
    pub fn write_qps_now(&self) -> u64 {
        self.qps_write_now.load(Ordering::Relaxed)
    }

    /// Reads observed since the window was last cleared.
    pub fn read_qps_now(&self) -> u64 {
        self.qps_read_now.load(Ordering::Relaxed)
    }

    /// Total bytes pushed to the device since open.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Immutable snapshot of all counters for reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.write_latency_samples.load(Ordering::Relaxed);
        let meta_allocs = self.meta_allocs.load(Ordering::Relaxed);
        let io_allocs = self.io_allocs.load(Ordering::Relaxed);
        MetricsSnapshot {
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            avg_write_latency_us: avg(self.write_latency_us.load(Ordering::Relaxed), samples),
            io_allocs,
            avg_io_alloc_latency_us: avg(
                self.io_alloc_latency_us.load(Ordering::Relaxed),
                io_allocs,
            ),
            meta_allocs,
            avg_meta_alloc_latency_us: avg(
                self.meta_alloc_latency_us.load(Ordering::Relaxed),
                meta_allocs,
            ),
            open_zones: self.open_zones.load(Ordering::Relaxed),
            active_zones: self.active_zones.load(Ordering::Relaxed),
        }
    }
}

fn avg(sum: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        sum / count
    }
}

/// Point-in-time view of the pool counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Zone appends completed.
    pub write_ops: u64,
    /// Pool reads completed.
    pub read_ops: u64,
    /// Bytes pushed to the device.
    pub bytes_written: u64,
    /// Mean append latency in microseconds.
    pub avg_write_latency_us: u64,
    /// I/O-zone allocations attempted.
    pub io_allocs: u64,
    /// Mean I/O allocation latency in microseconds.
    pub avg_io_alloc_latency_us: u64,
    /// Metadata-zone allocations attempted.
    pub meta_allocs: u64,
    /// Mean metadata allocation latency in microseconds.
    pub avg_meta_alloc_latency_us: u64,
    /// Open I/O zones at last gauge update.
    pub open_zones: u64,
    /// Active I/O zones at last gauge update.
    pub active_zones: u64,
}
