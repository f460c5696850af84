use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonically increasing counter.
#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Things a session counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    ConnectAttempt,
    ConnectSucceeded,
    ConnectFailed,
    Reconnect,
    FrameReceived,
    FrameSent,
    DecodeError,
    RequestSent,
    RequestTimeout,
    ComponentRestart,
}

/// Per-session connection counters. Owned by the session supervisor so the
/// values survive component restarts.
#[derive(Default)]
pub struct ConnectionMetrics {
    connect_attempts: Counter,
    successful_connects: Counter,
    failed_connects: Counter,
    reconnects: Counter,
    frames_received: Counter,
    frames_sent: Counter,
    decode_errors: Counter,
    requests_sent: Counter,
    request_timeouts: Counter,
    component_restarts: Counter,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: Metric) {
        self.counter(metric).increment();
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.counter(metric).get()
    }

    fn counter(&self, metric: Metric) -> &Counter {
        match metric {
            Metric::ConnectAttempt => &self.connect_attempts,
            Metric::ConnectSucceeded => &self.successful_connects,
            Metric::ConnectFailed => &self.failed_connects,
            Metric::Reconnect => &self.reconnects,
            Metric::FrameReceived => &self.frames_received,
            Metric::FrameSent => &self.frames_sent,
            Metric::DecodeError => &self.decode_errors,
            Metric::RequestSent => &self.requests_sent,
            Metric::RequestTimeout => &self.request_timeouts,
            Metric::ComponentRestart => &self.component_restarts,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.get(),
            successful_connects: self.successful_connects.get(),
            failed_connects: self.failed_connects.get(),
            reconnects: self.reconnects.get(),
            frames_received: self.frames_received.get(),
            frames_sent: self.frames_sent.get(),
            decode_errors: self.decode_errors.get(),
            requests_sent: self.requests_sent.get(),
            request_timeouts: self.request_timeouts.get(),
            component_restarts: self.component_restarts.get(),
        }
    }
}

/// Point-in-time copy of [`ConnectionMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub successful_connects: u64,
    pub failed_connects: u64,
    pub reconnects: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub decode_errors: u64,
    pub requests_sent: u64,
    pub request_timeouts: u64,
    pub component_restarts: u64,
}
