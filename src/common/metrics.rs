//! In-process metrics with Prometheus text exposition
//!
//! Counters and gauges for the replication core: writes, reads, apply
//! failures, health events, lifecycle transitions. Served on `/metrics`
//! by both the manager and the storage node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counter for monotonically increasing values
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    pub chunk_writes_total: Counter,
    pub chunk_write_failures_total: Counter,
    pub block_reads_total: Counter,
    pub block_read_failures_total: Counter,
    pub apply_failures_total: Counter,
    pub health_events_total: Counter,
    pub pipelines_closed_total: Counter,
    pub pipelines_destroyed_total: Counter,
    pub reports_received_total: Counter,
    pub bytes_written_total: Counter,
    pub bytes_read_total: Counter,

    pub open_pipelines: Gauge,
    pub hosted_containers: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            chunk_writes_total: Counter::new(),
            chunk_write_failures_total: Counter::new(),
            block_reads_total: Counter::new(),
            block_read_failures_total: Counter::new(),
            apply_failures_total: Counter::new(),
            health_events_total: Counter::new(),
            pipelines_closed_total: Counter::new(),
            pipelines_destroyed_total: Counter::new(),
            reports_received_total: Counter::new(),
            bytes_written_total: Counter::new(),
            bytes_read_total: Counter::new(),
            open_pipelines: Gauge::new(),
            hosted_containers: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 11] = [
            (
                "carton_chunk_writes_total",
                "Chunk write operations applied",
                &self.chunk_writes_total,
            ),
            (
                "carton_chunk_write_failures_total",
                "Chunk write operations that failed",
                &self.chunk_write_failures_total,
            ),
            (
                "carton_block_reads_total",
                "Block read operations served",
                &self.block_reads_total,
            ),
            (
                "carton_block_read_failures_total",
                "Block read operations that failed",
                &self.block_read_failures_total,
            ),
            (
                "carton_apply_failures_total",
                "Log entries that failed to apply locally",
                &self.apply_failures_total,
            ),
            (
                "carton_health_events_total",
                "Health events emitted to the lifecycle manager",
                &self.health_events_total,
            ),
            (
                "carton_pipelines_closed_total",
                "Pipelines transitioned to CLOSED",
                &self.pipelines_closed_total,
            ),
            (
                "carton_pipelines_destroyed_total",
                "Pipelines transitioned to DESTROYED",
                &self.pipelines_destroyed_total,
            ),
            (
                "carton_reports_received_total",
                "Node reports ingested by the manager",
                &self.reports_received_total,
            ),
            (
                "carton_bytes_written_total",
                "Total bytes written",
                &self.bytes_written_total,
            ),
            (
                "carton_bytes_read_total",
                "Total bytes read",
                &self.bytes_read_total,
            ),
        ];

        for (name, help, counter) in counters {
            writeln!(out, "# HELP {} {}", name, help).unwrap();
            writeln!(out, "# TYPE {} counter", name).unwrap();
            writeln!(out, "{} {}", name, counter.get()).unwrap();
        }

        let gauges: [(&str, &str, &Gauge); 2] = [
            (
                "carton_open_pipelines",
                "Pipelines currently OPEN",
                &self.open_pipelines,
            ),
            (
                "carton_hosted_containers",
                "Containers hosted on this node",
                &self.hosted_containers,
            ),
        ];

        for (name, help, gauge) in gauges {
            writeln!(out, "# HELP {} {}", name, help).unwrap();
            writeln!(out, "# TYPE {} gauge", name).unwrap();
            writeln!(out, "{} {}", name, gauge.get()).unwrap();
        }

        writeln!(out, "# HELP carton_uptime_seconds Process uptime").unwrap();
        writeln!(out, "# TYPE carton_uptime_seconds gauge").unwrap();
        writeln!(out, "carton_uptime_seconds {}", self.uptime_seconds()).unwrap();

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
