//! Go Dispatcher Observability Module
//!
//! In-process counters for what the dispatcher did with each message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

/// Counter metric
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Dispatch counters
#[derive(Debug)]
pub struct DispatchMetrics {
    pub inbound_received: Counter,
    pub outbound_received: Counter,
    pub events_received: Counter,
    pub published: Counter,
    pub persisted: Counter,
    pub unroutable_replies: Counter,
    pub events_absorbed: Counter,
    pub dropped: Counter,
    start_time: Instant,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        info!("Initializing dispatch metrics");
        Self {
            inbound_received: Counter::new(),
            outbound_received: Counter::new(),
            events_received: Counter::new(),
            published: Counter::new(),
            persisted: Counter::new(),
            unroutable_replies: Counter::new(),
            events_absorbed: Counter::new(),
            dropped: Counter::new(),
            start_time: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            inbound_received: self.inbound_received.get(),
            outbound_received: self.outbound_received.get(),
            events_received: self.events_received.get(),
            published: self.published.get(),
            persisted: self.persisted.get(),
            unroutable_replies: self.unroutable_replies.get(),
            events_absorbed: self.events_absorbed.get(),
            dropped: self.dropped.get(),
        }
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub uptime_secs: u64,
    pub inbound_received: u64,
    pub outbound_received: u64,
    pub events_received: u64,
    pub published: u64,
    pub persisted: u64,
    pub unroutable_replies: u64,
    pub events_absorbed: u64,
    pub dropped: u64,
}
