#![forbid(unsafe_code)]

// Server metrics: lock-free AtomicU64 counters and Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 8] = [
    100,        // 100µs
    500,        // 500µs
    1_000,      // 1ms
    5_000,      // 5ms
    25_000,     // 25ms
    100_000,    // 100ms
    500_000,    // 500ms
    2_500_000,  // 2.5s
];

const BUCKET_LABELS: [&str; 8] = ["0.0001", "0.0005", "0.001", "0.005", "0.025", "0.1", "0.5", "2.5"];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    rooms_closed_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    broadcasts_total: AtomicU64,
    deliveries_failed_total: AtomicU64,
    persist_failures_total: AtomicU64,
    peers_reaped_total: AtomicU64,

    connections_active: AtomicU64,

    message_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                rooms_closed_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                broadcasts_total: AtomicU64::new(0),
                deliveries_failed_total: AtomicU64::new(0),
                persist_failures_total: AtomicU64::new(0),
                peers_reaped_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_closed(&self) {
        self.inner.rooms_closed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_broadcasts(&self) {
        self.inner.broadcasts_total.fetch_add(1, Relaxed);
    }

    pub fn inc_deliveries_failed(&self) {
        self.inner.deliveries_failed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_persist_failures(&self) {
        self.inner.persist_failures_total.fetch_add(1, Relaxed);
    }

    pub fn inc_peers_reaped(&self) {
        self.inner.peers_reaped_total.fetch_add(1, Relaxed);
    }

    // --- Reads (tests and /health) ---

    pub fn deliveries_failed(&self) -> u64 {
        self.inner.deliveries_failed_total.load(Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.inner.persist_failures_total.load(Relaxed)
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    // --- Gauge ---

    /// Increments connections_active and returns an RAII guard that decrements on drop.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    // --- Histogram ---

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    // --- Prometheus rendering ---

    /// `rooms_active` and `peers_active` are passed in from the registries (on-demand gauges).
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        render_counter(&mut out, "partysync_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "partysync_messages_received_total", "Total frames received from clients", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "partysync_messages_sent_total", "Total frames written to clients", i.messages_sent_total.load(Relaxed));
        render_counter(&mut out, "partysync_errors_total", "Total errors reported to clients", i.errors_total.load(Relaxed));
        render_counter(&mut out, "partysync_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "partysync_rooms_closed_total", "Total rooms closed", i.rooms_closed_total.load(Relaxed));
        render_counter(&mut out, "partysync_joins_total", "Total room joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "partysync_leaves_total", "Total room leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "partysync_broadcasts_total", "Total room broadcasts", i.broadcasts_total.load(Relaxed));
        render_counter(&mut out, "partysync_deliveries_failed_total", "Broadcast deliveries that failed or timed out", i.deliveries_failed_total.load(Relaxed));
        render_counter(&mut out, "partysync_persist_failures_total", "Snapshot writes that were given up on", i.persist_failures_total.load(Relaxed));
        render_counter(&mut out, "partysync_peers_reaped_total", "Peers removed by the liveness reaper", i.peers_reaped_total.load(Relaxed));

        render_gauge(&mut out, "partysync_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "partysync_rooms_active", "Currently active rooms", rooms_active as u64);
        render_gauge(&mut out, "partysync_peers_active", "Currently joined peers", peers_active as u64);

        i.message_handling.render(
            "partysync_message_handling_seconds",
            "Inbound message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
