//! In-process metrics for the relay.
//!
//! Counters and gauges are plain atomics; there is no background collection.
//! The server surfaces them through its monitoring routes, in Prometheus
//! text exposition format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonically increasing counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Occupancy gauge. Tracks counts that go up and down.
#[derive(Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// The relay's metric set.
#[derive(Default)]
pub struct RelayMetrics {
    /// Currently open WebSocket connections.
    pub connections_active: Gauge,
    /// Rooms with at least one member.
    pub rooms_active: Gauge,
    /// Connections accepted since startup.
    pub connections_total: Counter,
    /// Inbound text frames received.
    pub messages_received: Counter,
    /// Envelopes forwarded peer-to-peer (offer/answer/ice-candidate).
    pub messages_forwarded: Counter,
    /// Membership notifications fanned out to rooms.
    pub broadcasts_sent: Counter,
    /// Frames rejected before dispatch.
    pub validation_errors: Counter,
    /// Valid frames with an unsatisfiable target.
    pub routing_errors: Counter,
    /// Writes dropped because the recipient queue was full or closed.
    pub delivery_failures: Counter,
}

/// Point-in-time copy of every metric, for JSON monitoring responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_active: i64,
    pub rooms_active: i64,
    pub connections_total: u64,
    pub messages_received: u64,
    pub messages_forwarded: u64,
    pub broadcasts_sent: u64,
    pub validation_errors: u64,
    pub routing_errors: u64,
    pub delivery_failures: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_active: self.connections_active.get(),
            rooms_active: self.rooms_active.get(),
            connections_total: self.connections_total.get(),
            messages_received: self.messages_received.get(),
            messages_forwarded: self.messages_forwarded.get(),
            broadcasts_sent: self.broadcasts_sent.get(),
            validation_errors: self.validation_errors.get(),
            routing_errors: self.routing_errors.get(),
            delivery_failures: self.delivery_failures.get(),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        gauge_line(
            &mut out,
            "relay_connections_active",
            "Currently open WebSocket connections",
            s.connections_active,
        );
        gauge_line(
            &mut out,
            "relay_rooms_active",
            "Rooms with at least one member",
            s.rooms_active,
        );
        counter_line(
            &mut out,
            "relay_connections_total",
            "Connections accepted since startup",
            s.connections_total,
        );
        counter_line(
            &mut out,
            "relay_messages_received_total",
            "Inbound text frames received",
            s.messages_received,
        );
        counter_line(
            &mut out,
            "relay_messages_forwarded_total",
            "Envelopes forwarded peer-to-peer",
            s.messages_forwarded,
        );
        counter_line(
            &mut out,
            "relay_broadcasts_total",
            "Membership notifications fanned out",
            s.broadcasts_sent,
        );
        counter_line(
            &mut out,
            "relay_validation_errors_total",
            "Frames rejected before dispatch",
            s.validation_errors,
        );
        counter_line(
            &mut out,
            "relay_routing_errors_total",
            "Frames with an unsatisfiable target",
            s.routing_errors,
        );
        counter_line(
            &mut out,
            "relay_delivery_failures_total",
            "Writes dropped at the recipient queue",
            s.delivery_failures,
        );
        out
    }
}

fn counter_line(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
    ));
}

fn gauge_line(out: &mut String, name: &str, help: &str, value: i64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
    ));
}
